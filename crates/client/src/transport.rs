use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct Writer {
    sink: SplitSink<WsStream, Message>,
    closed: CancellationToken,
}

/// Owner of the single socket to the machine.
///
/// Cloning shares the same socket. Only one connection is open at a time;
/// connecting again replaces (and releases) the previous one.
///
/// Every write has a deadline. A peer that stops draining the socket gets it
/// marked closed instead of holding the writer lock indefinitely.
#[derive(Clone)]
pub struct Transport {
    writer: Arc<Mutex<Option<Writer>>>,
    write_timeout: Duration,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self { writer: Arc::new(Mutex::new(None)), write_timeout }
    }

    /// Open the socket. Incoming text frames are read through the returned [`Frames`].
    pub async fn connect(&self, url: &str, connect_timeout: Duration, keepalive: Duration) -> Result<Frames> {
        let (stream, _response) = match timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(Error::Connect { url: url.to_string(), reason: e.to_string() }),
            Err(_) => return Err(Error::ConnectTimeout { url: url.to_string(), after: connect_timeout }),
        };
        let (sink, source) = stream.split();
        let closed = CancellationToken::new();

        let previous = self.writer.lock().await.replace(Writer { sink, closed: closed.clone() });
        if let Some(prev) = previous {
            prev.closed.cancel();
        }

        let mut keepalive = interval_at(Instant::now() + keepalive, keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Frames { source, closed, keepalive, transport: self.clone() })
    }

    /// Send one JSON object as a single text frame.
    pub async fn send(&self, message: &Value) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.write(Message::Text(text)).await?;
        debug!(%message, "Sent message");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.write(Message::Ping(Vec::new())).await
    }

    async fn write(&self, frame: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(w) if !w.closed.is_cancelled() => w,
            _ => return Err(Error::NotConnected),
        };
        match timeout(self.write_timeout, writer.sink.send(frame)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                // Ends the reader too, so the supervisor reconnects
                writer.closed.cancel();
                warn!(after_ms = self.write_timeout.as_millis() as u64, "WebSocket write stalled");
                Err(Error::WriteTimeout { after: self.write_timeout })
            }
        }
    }

    /// Close the socket if one is open. Safe to call repeatedly and from any state.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else { return };
        writer.closed.cancel();
        match timeout(CLOSE_GRACE, writer.sink.close()).await {
            Ok(Ok(())) => debug!("WebSocket closed"),
            Ok(Err(e)) => debug!(error = %e, "WebSocket close handshake failed"),
            Err(_) => debug!("WebSocket close handshake timed out"),
        }
    }
}

/// Incoming text frames of one connection.
///
/// Ends on a close frame, a protocol error, or a local [`Transport::close`];
/// it never reconnects by itself.
pub struct Frames {
    source: SplitStream<WsStream>,
    closed: CancellationToken,
    keepalive: Interval,
    transport: Transport,
}

impl Frames {
    pub async fn next(&mut self) -> Option<String> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = self.keepalive.tick() => {
                    if let Err(e) = self.transport.ping().await {
                        debug!(error = %e, "Keep-alive ping failed");
                    }
                }
                frame = self.source.next() => match frame {
                    Some(Ok(Message::Text(text))) => return Some(text),
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(cf) => info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received"),
                            None => info!("WebSocket close frame received"),
                        }
                        return None;
                    }
                    Some(Ok(_)) => {
                        // Binary, Ping, Pong: tungstenite answers pings itself
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return None;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return None;
                    }
                }
            }
        }
    }
}
