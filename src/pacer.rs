//! Downlink pacer: a bounded FIFO of provider-originated audio frames, drained
//! at a fixed cadence onto the carrier WebSocket, gated by the binary rate
//! limiter.
//!
//! Grounded on the teacher's `voice/audio_buffer.rs` (capacity eviction,
//! oldest-first drop with a `warn!` log) for the overflow policy, and
//! `voice/call_server.rs::start_audio_loop` (a `tokio::spawn`ed task driven by
//! `tokio::time::interval` racing a shutdown signal via `tokio::select!`) for
//! the tick architecture. The interval-gated-by-rate-limiter dequeue and the
//! send-interval debounce come from `original_source/audio_hook_server.py`'s
//! `_process_audio_buffer`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{warn, Instrument};

use crate::audio_constants::PACER_TICK_INTERVAL_MS;
use crate::rate_limiter::RateLimiter;

/// Shared downlink queue. `push` is called from the model-provider client's
/// reader task; the pacer task owns draining it.
pub struct DownlinkPacer {
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl DownlinkPacer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    /// Enqueue a downlink frame. If the queue is at capacity, the oldest frame
    /// is dropped to make room (the spec's oldest-drop overflow policy).
    pub fn push(&self, frame: Vec<u8>) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(
                capacity = self.capacity,
                "downlink pacer buffer full, dropping oldest frame"
            );
        }
        queue.push_back(frame);
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard any buffered frames, e.g. on barge-in or session teardown.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// Spawn the pacer task. `send` is invoked with each dequeued frame; returning
/// `Err` stops the task (mirrors "Genesys WebSocket closed while sending audio
/// frame" in the source integration). `shutdown` is a one-shot-style receiver
/// that ends the loop promptly on session teardown.
pub fn spawn<F>(
    pacer: Arc<DownlinkPacer>,
    mut rate_limiter: RateLimiter,
    send_interval: Duration,
    mut shutdown: mpsc::Receiver<()>,
    mut send: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Vec<u8>) -> bool + Send + 'static,
{
    // Captured at spawn time: this runs as its own tokio task, so without
    // this it would fall outside the session's tracing span and its
    // overflow warnings would be missing the session_id field.
    let parent_span = tracing::Span::current();
    tokio::spawn(async move {
        let mut last_send = Instant::now() - send_interval;
        let mut ticker = tokio::time::interval(Duration::from_millis(PACER_TICK_INTERVAL_MS));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    break;
                }
                _ = ticker.tick() => {
                    if pacer.is_empty() {
                        continue;
                    }
                    if last_send.elapsed() < send_interval {
                        continue;
                    }
                    if !rate_limiter.acquire() {
                        continue;
                    }
                    if let Some(frame) = pacer.pop() {
                        last_send = Instant::now();
                        if !send(frame) {
                            break;
                        }
                    }
                }
            }
        }
    }.instrument(parent_span))
}

/// Pad or chunk a downlink payload to the carrier's fixed frame size. The
/// final partial chunk at end-of-turn is padded with µ-law silence (0xFF,
/// the µ-law encoding of zero amplitude) rather than dropped.
pub fn chunk_to_frame_size(payload: &[u8], frame_bytes: usize) -> Vec<Vec<u8>> {
    const ULAW_SILENCE: u8 = 0xFF;
    if payload.is_empty() {
        return Vec::new();
    }
    payload
        .chunks(frame_bytes)
        .map(|chunk| {
            if chunk.len() == frame_bytes {
                chunk.to_vec()
            } else {
                let mut padded = chunk.to_vec();
                padded.resize(frame_bytes, ULAW_SILENCE);
                padded
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_and_retains_capacity() {
        let pacer = DownlinkPacer::new(50);
        for i in 0..60u32 {
            pacer.push(vec![i as u8]);
        }
        assert_eq!(pacer.len(), 50);
        // The 10 oldest (0..10) should have been dropped; first remaining is 10.
        let first = pacer.pop().unwrap();
        assert_eq!(first, vec![10u8]);
    }

    #[test]
    fn chunking_pads_final_partial_frame() {
        let payload = vec![1u8; 250];
        let frames = chunk_to_frame_size(&payload, 160);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 160);
        assert_eq!(frames[1].len(), 160);
        assert_eq!(frames[1][90], 0xFF);
    }

    #[test]
    fn chunking_empty_payload_yields_no_frames() {
        assert!(chunk_to_frame_size(&[], 160).is_empty());
    }
}
