use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::DeviceState;
use crate::transport::Transport;

/// Clears the snapshot and recycles the socket when status pushes stop.
///
/// It only closes the socket; the connection supervisor does the reconnecting.
pub struct LivenessMonitor {
    state: Arc<DeviceState>,
    transport: Transport,
    window: Duration,
    tick: Duration,
}

impl LivenessMonitor {
    pub fn new(state: Arc<DeviceState>, transport: Transport, window: Duration, tick: Duration) -> Self {
        Self { state, transport, window, tick }
    }

    /// One liveness check. Returns true when the snapshot was dropped.
    pub async fn check(&self, now: Instant) -> bool {
        let Some(last) = self.state.last_status().await else {
            return false;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed <= self.window {
            return false;
        }
        if !self.state.mark_unavailable(last).await {
            return false;
        }
        warn!(
            elapsed_secs = elapsed.as_secs_f64(),
            "No status update received, reconnecting WebSocket"
        );
        self.transport.close().await;
        true
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(Instant::now()).await;
                }
            }
        }
        debug!("Liveness monitor stopped");
    }
}
