use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::device::Device;
use crate::error::{Error, Result};

const PAUSE_EVERY: usize = 10;
const PAUSE: Duration = Duration::from_millis(100);

/// Shot history as exposed by a machine.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Value>>;
    async fn delete(&self, id: Value) -> Result<()>;
}

#[async_trait]
impl HistoryStore for Device {
    async fn list(&self) -> Result<Vec<Value>> {
        self.request_history_list().await
    }

    async fn delete(&self, id: Value) -> Result<()> {
        self.delete_history_item(id).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrimReport {
    pub total: usize,
    pub kept: usize,
    pub deleted: usize,
    pub failures: Vec<String>,
}

/// Delete all but the newest `max_shots` history entries, oldest first.
///
/// Individual delete failures are collected in the report rather than aborting the run.
pub async fn trim_history<S: HistoryStore + ?Sized>(store: &S, max_shots: usize) -> Result<TrimReport> {
    if max_shots == 0 {
        return Err(Error::InvalidArgument("max_shots must be a positive integer".to_string()));
    }

    let mut history = store.list().await?;
    history.sort_by_key(sort_key);

    let total = history.len();
    if total <= max_shots {
        info!(total, max_shots, "Shot history trim skipped");
        return Ok(TrimReport { total, kept: total, ..TrimReport::default() });
    }

    let excess = total - max_shots;
    let mut report = TrimReport { total, kept: max_shots, ..TrimReport::default() };
    for (idx, item) in history.into_iter().take(excess).enumerate() {
        let Some(id) = item.get("id").filter(|v| !v.is_null()).cloned() else {
            continue;
        };
        match store.delete(id.clone()).await {
            Ok(()) => report.deleted += 1,
            Err(e) => report.failures.push(format!("{}: {}", display_id(&id), e)),
        }
        // Go easy on the controller
        if (idx + 1) % PAUSE_EVERY == 0 {
            tokio::time::sleep(PAUSE).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    if report.failures.is_empty() {
        info!(kept = max_shots, deleted = report.deleted, "Trimmed shot history");
    } else {
        warn!(
            kept = max_shots,
            deleted = report.deleted,
            failures = %report.failures.join("; "),
            "Trimmed shot history with failed deletions"
        );
    }
    Ok(report)
}

// Oldest first by timestamp, then id; unparsable values sort as 0.
fn sort_key(item: &Value) -> (i64, i64) {
    (as_int(item.get("timestamp")), as_int(item.get("id")))
}

fn as_int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
