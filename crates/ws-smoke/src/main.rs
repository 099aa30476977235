use futures_util::{SinkExt, StreamExt};
use gaggimate_core::{ws_url, EVT_STATUS, MSG_OTA_SETTINGS, TYPE_FIELD};
use tokio::time::{timeout_at, Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[tokio::main]
async fn main() {
    let raw = std::env::args().nth(1).unwrap_or_else(|| ws_url("gaggimate.local", 80, false));
    let url = match Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => url,
        Ok(url) => {
            eprintln!("Unsupported scheme `{}`, expected ws or wss", url.scheme());
            std::process::exit(5);
        }
        Err(e) => {
            eprintln!("Invalid URL {}: {}", raw, e);
            std::process::exit(5);
        }
    };

    eprintln!("Connecting to {}", url);
    let ws_stream = match timeout_at(Instant::now() + Duration::from_secs(10), connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            eprintln!("WS connect failed: {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("Timeout connecting to {}", url);
            std::process::exit(1);
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // Poke the device so something comes back even between status pushes
    let poke = serde_json::json!({ (TYPE_FIELD): MSG_OTA_SETTINGS }).to_string();
    let _ = write.send(Message::Text(poke)).await;

    // Wait up to 5s for one status push, then print and exit
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match timeout_at(deadline, read.next()).await {
            Ok(Some(Ok(Message::Text(t)))) => {
                let is_status = serde_json::from_str::<serde_json::Value>(&t)
                    .map(|v| v.get(TYPE_FIELD).and_then(|tp| tp.as_str()) == Some(EVT_STATUS))
                    .unwrap_or(false);
                if is_status {
                    println!("Status: {}", t);
                    let _ = write.close().await;
                    return;
                }
                eprintln!("WS message: {}", t);
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                eprintln!("WS receive error: {}", e);
                std::process::exit(2);
            }
            Ok(None) => {
                eprintln!("WS closed by device");
                std::process::exit(3);
            }
            Err(_) => {
                eprintln!("Timeout waiting for status");
                std::process::exit(4);
            }
        }
    }
}
