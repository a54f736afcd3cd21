//! Progress reporting for transfers.
//!
//! A [`ProgressTracker`] owns one aggregate byte counter guarded by a single
//! lock. Each logical transfer unit (the whole payload for a sequential
//! transfer, one block for a parallel one) gets a [`UnitProgress`] handle
//! that remembers its own contribution. When a unit is retried its stale
//! contribution is taken back out before the new attempt reports from zero,
//! so a retried block never counts twice toward the total.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::ByteStream;

/// Bytes handed to the transport per body chunk
const BODY_SEGMENT_SIZE: usize = 64 * 1024;

/// Receives cumulative byte counts as a transfer advances
pub trait ProgressReceiver: Send + Sync {
    fn report_progress(&self, bytes_transferred: u64);
}

impl<F> ProgressReceiver for F
where
    F: Fn(u64) + Send + Sync,
{
    fn report_progress(&self, bytes_transferred: u64) {
        self(bytes_transferred)
    }
}

/// Shared progress counter for one logical transfer
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    receiver: Arc<dyn ProgressReceiver>,
    total_size: Option<u64>,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    reported: u64,
    units: Vec<u64>,
}

impl ProgressTracker {
    /// Create a tracker. `total_size`, when known, caps every reported value.
    pub fn new(receiver: Arc<dyn ProgressReceiver>, total_size: Option<u64>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                receiver,
                total_size,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Tracker with a single unit covering the whole transfer
    pub fn sequential(receiver: Arc<dyn ProgressReceiver>, total_size: Option<u64>) -> UnitProgress {
        Self::new(receiver, total_size).unit()
    }

    /// Register a new transfer unit
    pub fn unit(&self) -> UnitProgress {
        let mut state = self.inner.state.lock();
        state.units.push(0);
        UnitProgress {
            tracker: self.clone(),
            id: state.units.len() - 1,
        }
    }

    /// Aggregate currently counted across all units
    pub fn reported(&self) -> u64 {
        self.inner.state.lock().reported
    }

    fn advance(&self, unit: usize, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.units[unit] += delta;
        state.reported += delta;
        let value = match self.inner.total_size {
            Some(total) => state.reported.min(total),
            None => state.reported,
        };
        // Reported under the lock so receivers observe values in counter order.
        self.inner.receiver.report_progress(value);
    }

    fn rewind(&self, unit: usize) {
        let mut state = self.inner.state.lock();
        let stale = std::mem::take(&mut state.units[unit]);
        state.reported -= stale;
    }

    fn unit_value(&self, unit: usize) -> u64 {
        self.inner.state.lock().units[unit]
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_size", &self.inner.total_size)
            .field("reported", &self.reported())
            .finish()
    }
}

/// Handle for one logical transfer unit of a [`ProgressTracker`]
#[derive(Clone, Debug)]
pub struct UnitProgress {
    tracker: ProgressTracker,
    id: usize,
}

impl UnitProgress {
    /// Count `delta` more bytes for this unit
    pub fn advance(&self, delta: u64) {
        self.tracker.advance(self.id, delta);
    }

    /// Set this unit's cumulative count. A value below the current one means
    /// the unit restarted; its old contribution is rewound first.
    pub fn report_absolute(&self, cumulative: u64) {
        let current = self.tracker.unit_value(self.id);
        if cumulative < current {
            self.rewind();
            self.advance(cumulative);
        } else {
            self.advance(cumulative - current);
        }
    }

    /// Drop this unit's contribution ahead of a retry
    pub fn rewind(&self) {
        self.tracker.rewind(self.id);
    }

    /// Bytes currently counted for this unit
    pub fn value(&self) -> u64 {
        self.tracker.unit_value(self.id)
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }
}

/// Request body that can be streamed more than once.
///
/// Every call to [`stream`](Self::stream) is a fresh subscription: the
/// attached progress unit is rewound, then advanced as each chunk is
/// handed to whoever polls the stream.
#[derive(Clone)]
pub struct ReplayableBody {
    chunks: Arc<[Bytes]>,
    len: u64,
    progress: Option<UnitProgress>,
}

impl ReplayableBody {
    /// Body over `data`, handed out in fixed-size segments
    pub fn new(data: Bytes) -> Self {
        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(BODY_SEGMENT_SIZE)
            .map(|start| data.slice(start..(start + BODY_SEGMENT_SIZE).min(data.len())))
            .collect();
        Self::from_chunks(chunks)
    }

    /// Body made of exactly these chunks, in order
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            chunks: chunks.into(),
            len,
            progress: None,
        }
    }

    pub fn empty() -> Self {
        Self::from_chunks(Vec::new())
    }

    /// Report bytes of every subscription to `progress`
    pub fn with_progress(mut self, progress: UnitProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start a new subscription to the body
    pub fn stream(&self) -> ByteStream {
        let progress = self.progress.clone();
        if let Some(p) = &progress {
            p.rewind();
        }
        let chunks: Vec<Bytes> = self.chunks.iter().cloned().collect();
        Box::pin(futures_util::stream::iter(chunks).map(move |chunk| {
            if let Some(p) = &progress {
                p.advance(chunk.len() as u64);
            }
            Ok::<_, std::io::Error>(chunk)
        }))
    }
}

impl std::fmt::Debug for ReplayableBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayableBody")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// Count bytes of a one-shot stream (download bodies) against `progress`
pub fn track_stream(stream: ByteStream, progress: UnitProgress) -> ByteStream {
    Box::pin(stream.map(move |item| {
        if let Ok(chunk) = &item {
            progress.advance(chunk.len() as u64);
        }
        item
    }))
}
