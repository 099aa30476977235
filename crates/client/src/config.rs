use std::env;
use std::time::Duration;

use gaggimate_core::ws_url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub connect_timeout: Duration,
    /// Deadline for correlated requests.
    pub request_timeout: Duration,
    /// Silence after which the status snapshot is dropped and the socket recycled.
    pub unavailable_timeout: Duration,
    pub liveness_tick: Duration,
    pub keepalive_interval: Duration,
    /// Deadline for a single frame write; a stalled write recycles the socket.
    pub write_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
    /// Pause between single-degree temperature nudges.
    pub temperature_step_delay: Duration,
    /// Pause between switching to steam mode and activating the process.
    pub steam_activation_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "gaggimate.local".to_string(),
            port: 80,
            use_tls: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            unavailable_timeout: Duration::from_secs(10),
            liveness_tick: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            reconnect_delays: [1, 2, 4, 8, 16, 30].into_iter().map(Duration::from_secs).collect(),
            temperature_step_delay: Duration::from_millis(50),
            steam_activation_delay: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ..Self::default() }
    }

    pub fn from_env() -> Self {
        let mut cfg = ClientConfig::default();

        if let Ok(v) = env::var("GAGGIMATE_HOST") {
            if !v.is_empty() {
                cfg.host = v;
            }
        }
        if let Ok(v) = env::var("GAGGIMATE_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                cfg.port = p;
            }
        }
        if let Ok(v) = env::var("GAGGIMATE_USE_TLS") {
            if let Some(b) = parse_bool(&v) {
                cfg.use_tls = b;
            }
        }
        if let Some(d) = secs_var("GAGGIMATE_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout = d;
        }
        if let Some(d) = secs_var("GAGGIMATE_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = d;
        }
        if let Some(d) = secs_var("GAGGIMATE_UNAVAILABLE_TIMEOUT_SECS") {
            cfg.unavailable_timeout = d;
        }

        cfg
    }

    pub fn ws_url(&self) -> String {
        ws_url(&self.host, self.port, self.use_tls)
    }
}

fn secs_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
