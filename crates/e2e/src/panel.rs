//! Panel availability check before the control plane logs in

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Wait until `base_url` answers HTTP with a non-server-error status
pub async fn wait_for_panel(base_url: &str, timeout: Duration) -> E2eResult<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match client.get(base_url).send().await {
            Ok(resp) if !resp.status().is_server_error() => {
                info!("Panel at {} is up ({})", base_url, resp.status());
                return Ok(());
            }
            Ok(resp) => {
                warn!("Panel returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for panel at {}...", base_url);
                }
                if !e.is_connect() && !e.is_timeout() {
                    warn!("Panel check error: {}", e);
                }
            }
        }

        if start.elapsed() >= timeout {
            return Err(E2eError::PanelUnavailable {
                url: base_url.to_string(),
                attempts,
            });
        }
        sleep(RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_answering_panel_is_available() {
        let url = serve("200 OK").await;
        wait_for_panel(&url, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_panel_times_out() {
        let url = serve("503 Service Unavailable").await;
        let err = wait_for_panel(&url, Duration::from_secs(1)).await.unwrap_err();
        match err {
            E2eError::PanelUnavailable { attempts, .. } => assert!(attempts >= 2),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
