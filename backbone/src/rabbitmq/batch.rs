//! Time-window batching of validated messages.

use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::delivery::ValidatedMessage;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// How long a window stays open.
    pub window: Duration,
    /// Distance between the opening of two consecutive windows.
    pub creation_interval: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(200),
            creation_interval: Duration::from_millis(200),
        }
    }
}

impl BatchOptions {
    /// Windows may not overlap: a message in two batches would be acked twice.
    pub fn new(window: Duration, creation_interval: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(AppError::Config("batch window must be non-zero".into()));
        }
        if creation_interval < window {
            return Err(AppError::Config(format!(
                "batch creation interval ({creation_interval:?}) shorter than window ({window:?})"
            )));
        }
        Ok(Self {
            window,
            creation_interval,
        })
    }
}

/// Messages that arrived within one window. Never empty.
pub struct Batch<T> {
    messages: Vec<ValidatedMessage<T>>,
}

impl<T> Batch<T> {
    pub fn messages(&self) -> &[ValidatedMessage<T>] {
        &self.messages
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.messages.iter().map(|m| &m.message)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Acknowledge every message. All acks are attempted even when some
    /// fail; the failures are reported together.
    pub async fn ack_all(self) -> Result<()> {
        let total = self.messages.len();
        let tags: Vec<u64> = self.messages.iter().map(|m| m.delivery_tag).collect();
        let outcomes = join_all(self.messages.into_iter().map(ValidatedMessage::ack)).await;

        let mut failed = 0;
        for (tag, outcome) in tags.into_iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(%e, delivery_tag = tag, "ack failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(AppError::BatchAcknowledge { failed, total });
        }
        debug!(total, "batch acknowledged");
        Ok(())
    }
}

struct Windows<T> {
    inner: BoxStream<'static, ValidatedMessage<T>>,
    options: BatchOptions,
    next_open: Option<Instant>,
    exhausted: bool,
}

/// Group `messages` into arrival-time windows, skipping empty ones.
///
/// Messages arriving between two windows (creation interval longer than
/// the window) stay queued and land in the next window instead of being
/// dropped. When the input ends the open window is flushed.
pub fn batch<T: Send + 'static>(
    messages: BoxStream<'static, ValidatedMessage<T>>,
    options: BatchOptions,
) -> BoxStream<'static, Batch<T>> {
    let windows = Windows {
        inner: messages,
        options,
        next_open: None,
        exhausted: false,
    };

    stream::unfold(windows, |mut w| async move {
        while !w.exhausted {
            let now = Instant::now();
            let open = match w.next_open {
                Some(at) if at > now => at,
                _ => now,
            };
            sleep_until(open).await;
            w.next_open = Some(open + w.options.creation_interval);

            let deadline = sleep_until(open + w.options.window);
            tokio::pin!(deadline);

            let mut collected = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => break,
                    next = w.inner.next() => match next {
                        Some(message) => collected.push(message),
                        None => {
                            w.exhausted = true;
                            break;
                        }
                    },
                }
            }

            if !collected.is_empty() {
                return Some((Batch { messages: collected }, w));
            }
        }
        None
    })
    .boxed()
}
