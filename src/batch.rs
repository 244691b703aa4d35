//! Batch Accumulator
//!
//! Releases a batch at the earlier of the flush deadline (measured from the
//! first buffered envelope) or the size bound. A fresh buffer starts as soon
//! as one is released.

use crate::envelope::Envelope;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Batch {
    pub envelopes: Vec<Envelope>,
    /// When the first envelope entered the buffer.
    pub opened_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

pub struct BatchAccumulator {
    flush_interval: Duration,
    max_size: usize,
    buffer: Vec<Envelope>,
    opened_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(flush_interval: Duration, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            flush_interval,
            max_size,
            buffer: Vec::with_capacity(max_size),
            opened_at: None,
        }
    }

    /// Adds an envelope, returning the full batch when the size bound is hit.
    pub fn push(&mut self, env: Envelope, now: Instant) -> Option<Batch> {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.buffer.push(env);

        if self.buffer.len() >= self.max_size {
            return self.take();
        }
        None
    }

    /// Flush deadline of the open buffer, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.flush_interval)
    }

    /// Releases the batch if its deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// Releases whatever is buffered regardless of the deadline.
    pub fn take(&mut self) -> Option<Batch> {
        let opened_at = self.opened_at.take()?;
        let envelopes = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_size));
        Some(Batch {
            envelopes,
            opened_at,
        })
    }
}
