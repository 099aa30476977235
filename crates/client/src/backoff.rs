use std::time::Duration;

/// Escalating reconnect delays, clamped to the last entry of the table.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() { vec![Duration::from_secs(1)] } else { delays };
        Self { delays, attempt: 0 }
    }

    /// Delay for the given attempt count.
    pub fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt; bumps the counter for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
