use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gaggimate_core::{RID_FIELD, TYPE_FIELD};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

type Reply = Map<String, Value>;
type Waiters = HashMap<String, oneshot::Sender<Reply>>;

/// Table of requests waiting for a reply carrying their `rid`.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<Mutex<Waiters>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `message` with a fresh `rid` and park a waiter for it.
    ///
    /// Register before sending so a fast reply cannot slip past.
    pub fn register(&self, message: &mut Map<String, Value>) -> PendingReply {
        let rid = Uuid::new_v4().to_string();
        message.insert(RID_FIELD.to_string(), Value::String(rid.clone()));
        let request = message
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or("request")
            .to_string();

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(rid.clone(), tx);
        PendingReply { rid, request, rx, pending: self.pending.clone() }
    }

    /// Hand `reply` to the waiter for `rid`. Returns false when nobody was waiting.
    pub fn resolve(&self, rid: &str, reply: Reply) -> bool {
        let waiter = lock(&self.pending).remove(rid);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Fail every outstanding request with [`Error::RequestAborted`].
    pub fn abort_all(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Aborting pending requests");
        }
    }
}

fn lock(pending: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A parked waiter. Dropping it (timeout, send failure, caller gave up) removes its table entry.
pub struct PendingReply {
    rid: String,
    request: String,
    rx: oneshot::Receiver<Reply>,
    pending: Arc<Mutex<Waiters>>,
}

impl PendingReply {
    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub async fn wait(mut self, deadline: Duration) -> Result<Reply> {
        match timeout(deadline, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::RequestAborted(self.request.clone())),
            Err(_) => {
                debug!(rid = %self.rid, request = %self.request, "Timed out waiting for response");
                Err(Error::Timeout { request: self.request.clone(), after: deadline })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.rid);
    }
}
