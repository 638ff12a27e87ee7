//! The atomic-model capability set the engines drive, and the support types
//! models interact with: output bags, port events, state snapshots for
//! rollback, and the dynamic-structure request context.
//!
//! Models are opaque to the core beyond this trait. Ownership is exclusive:
//! a model lives in exactly one core's model table and is addressed by its
//! `ModelUuid`.

use std::sync::Arc;

use bytemuck::Pod;

use crate::message::{ModelUuid, PortId};
use crate::time::Timestamp;

/// Payload transformation attached to a direct-connect edge. Z-functions on a
/// path through the coupled hierarchy are composed left-to-right into one of
/// these.
pub type ZFunc<P> = Arc<dyn Fn(P) -> P + Send + Sync>;

/// A single inbound event as seen by a transition function.
#[derive(Clone, Debug)]
pub struct PortEvent<P> {
    pub port: PortId,
    pub payload: P,
}

/// Collects the messages a model emits from `output`. The engine fills in
/// source identity, destination and timestamp when routing.
pub struct OutputBag<P> {
    emits: Vec<(PortId, P)>,
}

impl<P> OutputBag<P> {
    pub(crate) fn new() -> Self {
        Self { emits: Vec::new() }
    }

    /// Emit `payload` on the model's output port `port`.
    pub fn emit(&mut self, port: PortId, payload: P) {
        self.emits.push((port, payload));
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, (PortId, P)> {
        self.emits.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.emits.is_empty()
    }
}

/// Opaque snapshot of a model's mutable state, stored by the optimistic core
/// in the per-model rollback history. Plain-old-data states round-trip through
/// `from_pod`/`read`; anything else can encode into raw bytes.
#[derive(Clone, Default)]
pub struct SavedState {
    bytes: Vec<u8>,
}

impl SavedState {
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_pod<T: Pod>(value: &T) -> Self {
        Self {
            bytes: bytemuck::bytes_of(value).to_vec(),
        }
    }

    pub fn read<T: Pod>(&self) -> Option<T> {
        bytemuck::try_pod_read_unaligned(&self.bytes).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read-only summary of a resident model, handed to termination functors and
/// available after a run for inspection.
#[derive(Clone, Debug)]
pub struct ModelView {
    pub name: String,
    pub uuid: ModelUuid,
    pub time_last: Timestamp,
    pub time_next: Timestamp,
    pub state: String,
}

/// Structural change requested from inside a `model_transition`. The
/// controller applies the batch between simulation steps, then re-runs
/// direct connect.
pub enum DsRequest<P> {
    AddModel(ModelSpec<P>),
    RemoveModel(String),
    Connect {
        src_model: String,
        src_port: String,
        dst_model: String,
        dst_port: String,
        z: Option<ZFunc<P>>,
    },
    Disconnect {
        src_model: String,
        src_port: String,
        dst_model: String,
        dst_port: String,
    },
}

/// Context passed to `model_transition` during the dynamic-structure phase.
/// Requests queue here; they are only applied while the controller holds the
/// simulation in the DS phase, so structure can never change mid-step.
pub struct DsContext<P> {
    requests: Vec<DsRequest<P>>,
}

impl<P> DsContext<P> {
    pub(crate) fn new() -> Self {
        Self { requests: Vec::new() }
    }

    pub fn add_model(&mut self, spec: ModelSpec<P>) {
        self.requests.push(DsRequest::AddModel(spec));
    }

    pub fn remove_model(&mut self, name: impl Into<String>) {
        self.requests.push(DsRequest::RemoveModel(name.into()));
    }

    pub fn connect(
        &mut self,
        src_model: impl Into<String>,
        src_port: impl Into<String>,
        dst_model: impl Into<String>,
        dst_port: impl Into<String>,
        z: Option<ZFunc<P>>,
    ) {
        self.requests.push(DsRequest::Connect {
            src_model: src_model.into(),
            src_port: src_port.into(),
            dst_model: dst_model.into(),
            dst_port: dst_port.into(),
            z,
        });
    }

    pub fn disconnect(
        &mut self,
        src_model: impl Into<String>,
        src_port: impl Into<String>,
        dst_model: impl Into<String>,
        dst_port: impl Into<String>,
    ) {
        self.requests.push(DsRequest::Disconnect {
            src_model: src_model.into(),
            src_port: src_port.into(),
            dst_model: dst_model.into(),
            dst_port: dst_port.into(),
        });
    }

    pub(crate) fn take_requests(&mut self) -> Vec<DsRequest<P>> {
        std::mem::take(&mut self.requests)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// An atomic PDEVS model.
///
/// `time_advance` must never be negative; zero is legal and resolves through
/// the causality counter. `confluent_transition` handles a simultaneous
/// internal and external event; the default sequences internal then external
/// with zero elapsed time, which is also what the formalism prescribes as the
/// fallback.
pub trait AtomicModel<P>: Send {
    fn time_advance(&self) -> Timestamp;

    fn output(&self, bag: &mut OutputBag<P>);

    fn internal_transition(&mut self);

    fn external_transition(&mut self, elapsed: Timestamp, inputs: &[PortEvent<P>]);

    fn confluent_transition(&mut self, inputs: &[PortEvent<P>]) {
        self.internal_transition();
        self.external_transition(Timestamp::zero(), inputs);
    }

    /// Lower bound between now and this model's next externally visible
    /// event. Only consulted by the conservative engine, which requires
    /// strictly positive real time; `Timestamp::from_time(1)` is the
    /// smallest legal answer there.
    fn lookahead(&self) -> Timestamp {
        Timestamp::infinity()
    }

    /// Dynamic-structure hook. Return true to put the simulation into the DS
    /// phase; queue structural requests on `ds`.
    fn model_transition(&mut self, _ds: &mut DsContext<P>) -> bool {
        false
    }

    /// Snapshot of the mutable state, required by the optimistic engine.
    fn save_state(&self) -> SavedState {
        SavedState::empty()
    }

    fn restore_state(&mut self, _state: &SavedState) {}

    /// Human-readable state summary used by tracers and termination functors.
    fn describe(&self) -> String {
        String::new()
    }
}

/// Everything needed to register an atomic model: name, port declarations,
/// optional core request, and the model itself.
pub struct ModelSpec<P> {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub requested_core: Option<usize>,
    pub model: Box<dyn AtomicModel<P>>,
}

impl<P> ModelSpec<P> {
    pub fn new(name: impl Into<String>, model: Box<dyn AtomicModel<P>>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requested_core: None,
            model,
        }
    }

    pub fn with_input(mut self, port: impl Into<String>) -> Self {
        self.inputs.push(port.into());
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    /// Ask the allocator to place this model on a specific core. Respected
    /// modulo the configured core count.
    pub fn on_core(mut self, core: usize) -> Self {
        self.requested_core = Some(core);
        self
    }
}
