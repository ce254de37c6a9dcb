//! Bounded producer/consumer staging between TTS and the player.
//!
//! Carries opaque PCM frames plus an end-of-utterance sentinel. The producer
//! blocks when the queue is full (backpressure, no drop policy); the consumer
//! blocks when it is empty. Barge-in drains the queue in place.

use crate::error::{OrchestratorError, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::warn;

/// Queue capacity in frames.
pub const STAGING_CAPACITY: usize = 32;

/// Occupancy at which the pressure warning fires (75% of capacity).
pub const PRESSURE_WARN_OCCUPANCY: usize = STAGING_CAPACITY * 3 / 4;

/// A frame in the staging queue.
///
/// PCM payloads are opaque to the orchestrator; only their length and the
/// sentinel are ever inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedFrame {
    /// Raw PCM bytes (i16 little-endian mono at the TTS output rate).
    Pcm(Bytes),
    /// Boundary between two synthesized sentences. Lets the consumer resume
    /// at the next sentence after a player crash.
    SentenceBoundary,
    /// The current utterance is complete; the consumer should finish playback.
    EndOfUtterance,
}

/// Bounded FIFO of staged frames with drain-on-interrupt.
///
/// Clones share the same queue. The design is single-producer /
/// single-consumer per turn; the internal receiver mutex only serializes the
/// consumer against the barge-in drain.
#[derive(Clone)]
pub struct AudioStaging {
    tx: mpsc::Sender<StagedFrame>,
    rx: Arc<Mutex<mpsc::Receiver<StagedFrame>>>,
    notify: Arc<Notify>,
    pressure_warned: Arc<AtomicBool>,
    pressure_events: Arc<AtomicU64>,
}

impl Default for AudioStaging {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioStaging {
    /// Create an empty staging queue at the fixed capacity.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(STAGING_CAPACITY);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            notify: Arc::new(Notify::new()),
            pressure_warned: Arc::new(AtomicBool::new(false)),
            pressure_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a frame, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Channel`] when the consumer side is gone.
    pub async fn send(&self, frame: StagedFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| OrchestratorError::Channel("audio staging consumer gone".into()))?;
        self.notify.notify_one();
        self.check_pressure();
        Ok(())
    }

    /// Dequeue the next frame, waiting while the queue is empty.
    ///
    /// The receiver lock is never held across an await, so a concurrent
    /// `drain` always gets through even while the consumer is parked here.
    pub async fn recv(&self) -> Option<StagedFrame> {
        loop {
            {
                let mut rx = self.rx.lock().await;
                match rx.try_recv() {
                    Ok(frame) => {
                        drop(rx);
                        if self.occupancy() < PRESSURE_WARN_OCCUPANCY {
                            self.pressure_warned.store(false, Ordering::Relaxed);
                        }
                        return Some(frame);
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }
            // notify_one stores a permit, so a send landing between the
            // unlock above and this await is never lost.
            self.notify.notified().await;
        }
    }

    /// Empty the queue and reset the pressure latch. Returns the number of
    /// frames discarded.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.pressure_warned.store(false, Ordering::Relaxed);
        discarded
    }

    /// Current number of queued frames.
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// How many times the pressure warning has fired.
    pub fn pressure_events(&self) -> u64 {
        self.pressure_events.load(Ordering::Relaxed)
    }

    /// Warn once per crossing when occupancy reaches 75% of capacity.
    fn check_pressure(&self) {
        let occupancy = self.occupancy();
        if occupancy >= PRESSURE_WARN_OCCUPANCY {
            if !self.pressure_warned.swap(true, Ordering::Relaxed) {
                self.pressure_events.fetch_add(1, Ordering::Relaxed);
                warn!(
                    occupancy,
                    capacity = STAGING_CAPACITY,
                    "audio staging under pressure"
                );
            }
        } else {
            self.pressure_warned.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    fn pcm(n: u8) -> StagedFrame {
        StagedFrame::Pcm(Bytes::from(vec![n; 4]))
    }

    #[tokio::test]
    async fn frames_pass_in_order() {
        let staging = AudioStaging::new();
        staging.send(pcm(1)).await.unwrap();
        staging.send(pcm(2)).await.unwrap();
        staging.send(StagedFrame::EndOfUtterance).await.unwrap();

        assert_eq!(staging.recv().await, Some(pcm(1)));
        assert_eq!(staging.recv().await, Some(pcm(2)));
        assert_eq!(staging.recv().await, Some(StagedFrame::EndOfUtterance));
    }

    #[tokio::test]
    async fn send_blocks_when_full() {
        let staging = AudioStaging::new();
        for i in 0..STAGING_CAPACITY {
            staging.send(pcm(i as u8)).await.unwrap();
        }
        assert_eq!(staging.occupancy(), STAGING_CAPACITY);

        // The 33rd send must not complete until a frame is consumed.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), staging.send(pcm(99))).await;
        assert!(blocked.is_err(), "send should block at capacity");

        let _ = staging.recv().await;
        tokio::time::timeout(Duration::from_millis(200), staging.send(pcm(99)))
            .await
            .expect("send should proceed after a recv")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_empties_queue() {
        let staging = AudioStaging::new();
        for i in 0..10 {
            staging.send(pcm(i)).await.unwrap();
        }
        assert_eq!(staging.drain().await, 10);
        assert_eq!(staging.occupancy(), 0);

        // The queue keeps working after a drain.
        staging.send(pcm(42)).await.unwrap();
        assert_eq!(staging.recv().await, Some(pcm(42)));
    }

    #[tokio::test]
    async fn pressure_warning_fires_once_per_crossing() {
        let staging = AudioStaging::new();
        for i in 0..PRESSURE_WARN_OCCUPANCY {
            staging.send(pcm(i as u8)).await.unwrap();
        }
        assert_eq!(staging.pressure_events(), 1);

        // Staying above the line does not re-fire.
        staging.send(pcm(100)).await.unwrap();
        assert_eq!(staging.pressure_events(), 1);

        // Dropping below and crossing again fires a second event.
        while staging.occupancy() >= PRESSURE_WARN_OCCUPANCY - 2 {
            let _ = staging.recv().await;
        }
        while staging.occupancy() < PRESSURE_WARN_OCCUPANCY {
            staging.send(pcm(7)).await.unwrap();
        }
        assert_eq!(staging.pressure_events(), 2);
    }

    #[tokio::test]
    async fn occupancy_tracks_sends_and_recvs() {
        let staging = AudioStaging::new();
        assert_eq!(staging.occupancy(), 0);
        staging.send(pcm(1)).await.unwrap();
        staging.send(pcm(2)).await.unwrap();
        assert_eq!(staging.occupancy(), 2);
        let _ = staging.recv().await;
        assert_eq!(staging.occupancy(), 1);
    }
}
