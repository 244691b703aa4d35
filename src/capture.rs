//! Capture files and replay.
//!
//! A capture is a recorded slice of bus traffic. Replaying one feeds its
//! messages, in file order, into the same inbound channel the live bus
//! uses. Messages are stamped with the replay time, not the recorded time,
//! so retention behaves as it would live.

use crate::envelope::RawMessage;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureInfo {
    #[serde(default)]
    pub capture_time: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub total_messages: Option<u64>,
    #[serde(default)]
    pub topics_captured: Vec<String>,
    #[serde(default)]
    pub message_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedMessage {
    pub topic: String,
    /// Decoded JSON, or the raw text when the payload was not JSON.
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl CapturedMessage {
    fn payload_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Value::String(text) => text.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureFile {
    #[serde(default)]
    pub capture_info: CaptureInfo,
    pub messages: Vec<CapturedMessage>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaptureDocument {
    Full(CaptureFile),
    Bare(Vec<CapturedMessage>),
}

impl CaptureFile {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str::<CaptureDocument>(text)? {
            CaptureDocument::Full(file) => file,
            CaptureDocument::Bare(messages) => CaptureFile {
                capture_info: CaptureInfo::default(),
                messages,
            },
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read capture file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse capture file {}", path.display()))
    }
}

/// Feeds every captured message into `inbound` as fast as it accepts them.
/// Returns how many were sent before shutdown or a closed channel.
pub async fn replay_into(
    capture: CaptureFile,
    inbound: mpsc::Sender<RawMessage>,
    shutdown: watch::Receiver<bool>,
) -> usize {
    info!(
        "▶️  Replaying {} captured messages ({} topics)",
        capture.messages.len(),
        capture.capture_info.topics_captured.len()
    );

    let mut sent = 0;
    for message in &capture.messages {
        if *shutdown.borrow() {
            break;
        }
        let raw = RawMessage::new(message.topic.clone(), message.payload_bytes(), Utc::now());
        if inbound.send(raw).await.is_err() {
            break;
        }
        sent += 1;
    }

    info!("⏹️  Replay finished ({} messages sent)", sent);
    sent
}
