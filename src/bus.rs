//! Message bus subscription over Redis pub/sub.
//!
//! Every delivered message is stamped with its arrival time and pushed
//! into the bounded inbound channel. A full channel blocks the reader, so a
//! slow pipeline pushes back on the bus instead of buffering without bound.

use crate::envelope::RawMessage;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Translates a dot-separated topic pattern into a Redis glob. Both
/// wildcards widen to `*`; the normalizer re-checks the exact topic.
pub fn to_redis_glob(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|token| match token {
            "*" | ">" => "*".to_string(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Subscribes to `patterns` and forwards messages until shutdown, or until
/// the pipeline stops receiving. A subscription that ends on its own is an
/// error.
pub async fn forward_messages(
    client: redis::Client,
    patterns: Vec<String>,
    inbound: mpsc::Sender<RawMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut pubsub = client
        .get_async_connection()
        .await
        .context("Failed to get Redis async connection")?
        .into_pubsub();

    for pattern in &patterns {
        let glob = to_redis_glob(pattern);
        pubsub
            .psubscribe(&glob)
            .await
            .with_context(|| format!("Failed to subscribe to {}", glob))?;
        info!("👂 Subscribed to {}", glob);
    }

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("🛑 Bus reader stopping");
                return Ok(());
            }
            next = messages.next() => {
                let Some(msg) = next else {
                    return Err(anyhow!("Bus subscription ended unexpectedly"));
                };
                let raw = RawMessage::new(msg.get_channel_name(), msg.get_payload_bytes(), Utc::now());
                debug!("Received message on {}", raw.topic);

                if inbound.send(raw).await.is_err() {
                    warn!("⚠️  Inbound channel closed, bus reader stopping");
                    return Ok(());
                }
            }
        }
    }
}
