//! The playback buffer: serializes downloaded chunks for a consumer that
//! reads at playback rate.
//!
//! Chunks are keyed by sequence number in a sorted map, so out-of-order
//! arrivals cost nothing and the head is always the next candidate for
//! playback. Three watermarks (start, low, target) in seconds of content
//! drive startup, refill, and steady state. When the in-memory byte cap
//! is exceeded, incoming chunks spill to scoped temp files which are
//! removed once their bytes have been handed to the consumer.

use crate::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Seconds of content one chunk represents.
    pub chunk_duration_secs: f64,
    /// Steady-state level the download loop aims for.
    pub target_buffer_secs: f64,
    /// Below this, the buffer asks for more.
    pub low_water_mark_secs: f64,
    /// Level required before playback may start.
    pub start_playback_secs: f64,
    /// In-memory byte cap; chunks beyond it spill to disk.
    pub max_memory_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 10.0,
            target_buffer_secs: 30.0,
            low_water_mark_secs: 15.0,
            start_playback_secs: 10.0,
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
enum Payload {
    Memory(Bytes),
    // The temp file is deleted when this entry drops, which happens only
    // after the bytes are materialized for the consumer.
    Spilled(tempfile::NamedTempFile),
}

#[derive(Debug)]
struct BufferedChunk {
    chunk_id: String,
    size: usize,
    payload: Payload,
}

/// A chunk handed to the consumer.
#[derive(Debug, Clone)]
pub struct PlayedChunk {
    pub chunk_id: String,
    pub sequence_num: u32,
    pub bytes: Bytes,
}

/// Observability snapshot of the buffer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BufferStatus {
    pub level_secs: f64,
    pub level_chunks: usize,
    pub state: &'static str,
    pub current_position: u32,
    pub playback_started: bool,
    pub needs_more: bool,
    pub can_start: bool,
    pub memory_bytes: usize,
    pub buffered_total: u64,
    pub played_total: u64,
    pub rebuffer_events: u64,
}

#[derive(Default, Debug)]
struct State {
    chunks: BTreeMap<u32, BufferedChunk>,
    memory_bytes: usize,
    position: u32,
    playback_started: bool,
    buffered_total: u64,
    played_total: u64,
    rebuffer_events: u64,
}

/// The buffer is a single monitor: every mutation happens under one lock,
/// and waiters are signalled through `changed` (any mutation) and `ready`
/// (the start-playback watermark).
#[derive(Debug)]
pub struct PlaybackBuffer {
    cfg: BufferConfig,
    state: Mutex<State>,
    changed: tokio::sync::Notify,
    ready: tokio::sync::watch::Sender<bool>,
}

impl PlaybackBuffer {
    pub fn new(cfg: BufferConfig) -> Self {
        let (ready, _) = tokio::sync::watch::channel(false);
        Self {
            cfg,
            state: Mutex::new(State::default()),
            changed: tokio::sync::Notify::new(),
            ready,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.cfg
    }

    /// Insert a downloaded chunk.
    ///
    /// Returns `Ok(false)` for stale chunks (already played) and
    /// duplicates, leaving state untouched. Spill failures reject the add;
    /// the caller may retry.
    pub fn add(&self, chunk_id: &str, sequence_num: u32, bytes: Bytes) -> Result<bool> {
        let mut state = self.state.lock().unwrap();

        if sequence_num < state.position {
            tracing::debug!(chunk_id, sequence_num, position = state.position, "stale chunk");
            return Ok(false);
        }
        if state.chunks.contains_key(&sequence_num) {
            tracing::debug!(chunk_id, sequence_num, "duplicate chunk");
            return Ok(false);
        }

        let size = bytes.len();
        let payload = if state.memory_bytes + size > self.cfg.max_memory_bytes {
            let mut file = tempfile::NamedTempFile::new().map_err(Error::Spill)?;
            file.write_all(&bytes).map_err(Error::Spill)?;
            tracing::debug!(chunk_id, sequence_num, "spilled chunk to disk");
            Payload::Spilled(file)
        } else {
            state.memory_bytes += size;
            Payload::Memory(bytes)
        };

        state.chunks.insert(
            sequence_num,
            BufferedChunk {
                chunk_id: chunk_id.to_string(),
                size,
                payload,
            },
        );
        state.buffered_total += 1;

        let can_start = self.level_of(&state) >= self.cfg.start_playback_secs;
        drop(state);

        self.changed.notify_waiters();
        if can_start {
            self.ready.send_replace(true);
        }
        Ok(true)
    }

    /// Remove and return the chunk at the playback position.
    ///
    /// `Ok(None)` means either a gap (the head is ahead of the position;
    /// the scheduler should refill) or an empty buffer. An empty buffer
    /// after playback has started counts as an underrun: observable, never
    /// fatal.
    pub fn take(&self) -> Result<Option<PlayedChunk>> {
        let mut state = self.state.lock().unwrap();

        let Some((&head, _)) = state.chunks.first_key_value() else {
            if state.playback_started {
                state.rebuffer_events += 1;
                tracing::warn!(
                    rebuffer_events = state.rebuffer_events,
                    "buffer underrun"
                );
                drop(state);
                self.ready.send_replace(false);
            }
            return Ok(None);
        };

        if head != state.position {
            tracing::warn!(
                expected = state.position,
                head,
                "gap in buffered sequence"
            );
            return Ok(None);
        }

        let chunk = state.chunks.remove(&head).expect("head exists");
        let bytes = match chunk.payload {
            Payload::Memory(bytes) => {
                state.memory_bytes -= chunk.size;
                bytes
            }
            Payload::Spilled(file) => {
                // Materialize before the temp file is dropped (deleted).
                let data = std::fs::read(file.path()).map_err(Error::SpillRead)?;
                Bytes::from(data)
            }
        };

        state.position += 1;
        state.played_total += 1;
        if !state.playback_started {
            state.playback_started = true;
            tracing::info!("playback started");
        }
        let sequence_num = head;
        let chunk_id = chunk.chunk_id;
        drop(state);

        self.changed.notify_waiters();
        Ok(Some(PlayedChunk {
            chunk_id,
            sequence_num,
            bytes,
        }))
    }

    /// The next `count` sequence numbers to fetch: starting just past the
    /// highest buffered sequence, or at the playback position when empty.
    pub fn next_sequences(&self, count: usize) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let from = state
            .chunks
            .last_key_value()
            .map(|(&seq, _)| seq + 1)
            .unwrap_or(state.position);
        (from..from + count as u32).collect()
    }

    /// Sequences missing between the playback position and the buffered
    /// tail. Non-empty only when a chunk failed on every replica while
    /// later chunks arrived; the download loop refetches these before
    /// extending past the tail.
    pub fn gap_sequences(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let Some((&tail, _)) = state.chunks.last_key_value() else {
            return Vec::new();
        };
        (state.position..tail)
            .filter(|seq| !state.chunks.contains_key(seq))
            .collect()
    }

    fn level_of(&self, state: &State) -> f64 {
        state.chunks.len() as f64 * self.cfg.chunk_duration_secs
    }

    /// Buffered content, in seconds.
    pub fn level_secs(&self) -> f64 {
        self.level_of(&self.state.lock().unwrap())
    }

    pub fn needs_more(&self) -> bool {
        self.level_secs() < self.cfg.low_water_mark_secs
    }

    pub fn can_start(&self) -> bool {
        self.level_secs() >= self.cfg.start_playback_secs
    }

    pub fn position(&self) -> u32 {
        self.state.lock().unwrap().position
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.state.lock().unwrap();
        let level = self.level_of(&state);

        let label = if state.chunks.is_empty() {
            "empty"
        } else if level < self.cfg.start_playback_secs {
            "initializing"
        } else if level < self.cfg.low_water_mark_secs {
            "low"
        } else if level >= self.cfg.target_buffer_secs {
            "full"
        } else {
            "healthy"
        };

        BufferStatus {
            level_secs: level,
            level_chunks: state.chunks.len(),
            state: label,
            current_position: state.position,
            playback_started: state.playback_started,
            needs_more: level < self.cfg.low_water_mark_secs,
            can_start: level >= self.cfg.start_playback_secs,
            memory_bytes: state.memory_bytes,
            buffered_total: state.buffered_total,
            played_total: state.played_total,
            rebuffer_events: state.rebuffer_events,
        }
    }

    /// Wait for any buffer mutation, up to `timeout`. Returns whether a
    /// change was seen.
    pub async fn wait_for_change(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.changed.notified())
            .await
            .is_ok()
    }

    /// Wait until the start-playback watermark is (again) satisfied.
    pub async fn wait_for_playback_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Drop all buffered and spilled data and zero every counter.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        // Spilled temp files are deleted as their entries drop.
        *state = State::default();
        drop(state);

        self.ready.send_replace(false);
        self.changed.notify_waiters();
        tracing::info!("buffer reset");
    }
}
