//! Trace output with commit/revert semantics.
//!
//! Engines record every transition as it happens; records stay buffered until
//! a flush commits everything strictly older than a safe time (the GVT in
//! optimistic runs, the save interval elsewhere). A rollback discards
//! uncommitted records at or past the revert time. Tracer failures must never
//! abort a simulation, so the trait is infallible by construction.

use std::sync::{Arc, Mutex};

use crate::time::Timestamp;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TraceKind {
    Init,
    Internal,
    External,
    Confluent,
}

#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub time: Timestamp,
    pub core: usize,
    pub model: String,
    pub kind: TraceKind,
    pub state: String,
}

pub trait Tracer: Send {
    /// Buffer one record. Not yet visible to readers.
    fn record(&mut self, record: TraceRecord);

    /// Commit every buffered record with time strictly below `mark`.
    fn flush_until(&mut self, mark: Timestamp);

    /// Drop every uncommitted record with time at or past `mark`.
    fn revert_until(&mut self, mark: Timestamp);
}

/// The tracers attached to a run, shared across cores.
#[derive(Clone, Default)]
pub struct TracerSet {
    tracers: Arc<Mutex<Vec<Box<dyn Tracer>>>>,
}

impl TracerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, tracer: Box<dyn Tracer>) {
        self.tracers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tracer);
    }

    pub fn record(&self, record: TraceRecord) {
        let mut guard = self.tracers.lock().unwrap_or_else(|e| e.into_inner());
        for tracer in guard.iter_mut() {
            tracer.record(record.clone());
        }
    }

    pub fn flush_until(&self, mark: Timestamp) {
        let mut guard = self.tracers.lock().unwrap_or_else(|e| e.into_inner());
        for tracer in guard.iter_mut() {
            tracer.flush_until(mark);
        }
    }

    pub fn revert_until(&self, mark: Timestamp) {
        let mut guard = self.tracers.lock().unwrap_or_else(|e| e.into_inner());
        for tracer in guard.iter_mut() {
            tracer.revert_until(mark);
        }
    }
}

/// In-memory tracer. Committed records can be read through the shared handle
/// while the run is still in flight, or collected afterwards.
pub struct CollectTracer {
    buffered: Vec<TraceRecord>,
    committed: Arc<Mutex<Vec<TraceRecord>>>,
}

impl CollectTracer {
    pub fn new() -> (Self, Arc<Mutex<Vec<TraceRecord>>>) {
        let committed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                buffered: Vec::new(),
                committed: Arc::clone(&committed),
            },
            committed,
        )
    }
}

impl Tracer for CollectTracer {
    fn record(&mut self, record: TraceRecord) {
        self.buffered.push(record);
    }

    fn flush_until(&mut self, mark: Timestamp) {
        let mut keep = Vec::new();
        let mut commit = Vec::new();
        for record in self.buffered.drain(..) {
            if record.time < mark {
                commit.push(record);
            } else {
                keep.push(record);
            }
        }
        self.buffered = keep;
        if commit.is_empty() {
            return;
        }
        commit.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.model.cmp(&b.model)));
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(commit);
    }

    fn revert_until(&mut self, mark: Timestamp) {
        self.buffered.retain(|r| r.time < mark);
    }
}
