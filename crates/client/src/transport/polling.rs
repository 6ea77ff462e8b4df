//! HTTP long-polling fallback over `reqwest`.
//!
//! `POST {base}` opens a session, `POST {base}/{id}` uploads client frames,
//! `GET {base}/{id}` long-polls for server frames and `DELETE {base}/{id}`
//! closes the session.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::link::{Connector, Link, TransportKind};
use crate::error::TransportError;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSession {
    session_id: String,
}

pub struct LongPollingConnector {
    base_url: String,
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl LongPollingConnector {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for LongPollingConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        let response = self
            .http
            .post(&self.base_url)
            .timeout(self.connect_timeout)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let session: OpenSession = response
            .json()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let session_url = format!("{}/{}", self.base_url, session.session_id);
        let (out_tx, out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        tokio::spawn(upload_loop(self.http.clone(), session_url.clone(), out_rx));
        tokio::spawn(poll_loop(self.http.clone(), session_url, in_tx));

        tracing::debug!(session = %session.session_id, "long-polling link established");
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn upload_loop(http: reqwest::Client, url: String, mut out_rx: mpsc::Receiver<String>) {
    while let Some(first) = out_rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = out_rx.try_recv() {
            batch.push(next);
        }

        let frames: Vec<serde_json::Value> = batch
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect();
        let result = http.post(&url).json(&frames).send().await;
        match result.and_then(|r| r.error_for_status()) {
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("long-polling upload failed: {}", e);
                break;
            }
        }
    }

    // All senders dropped or the session is gone.
    let _ = http.delete(&url).send().await;
}

async fn poll_loop(http: reqwest::Client, url: String, in_tx: mpsc::Sender<String>) {
    loop {
        let response = match http.get(&url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("long-polling request failed: {}", e);
                break;
            }
        };

        let frames: Vec<serde_json::Value> = match response.json().await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::debug!("long-polling response undecodable: {}", e);
                break;
            }
        };

        for frame in frames {
            if in_tx.send(frame.to_string()).await.is_err() {
                return;
            }
        }

        if in_tx.is_closed() {
            return;
        }
    }
}
