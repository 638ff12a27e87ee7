//! # Virta
//!
//! A parallel discrete-event simulation core for the PDEVS formalism. A
//! network of atomic models is advanced in simulated time across worker
//! threads under one of three synchronization strategies:
//!
//! - [`controller::SimType::Sequential`] / [`controller::SimType::DynamicStructure`] -
//!   a single-core baseline, the latter with structural changes between steps
//! - [`controller::SimType::Conservative`] - lookahead-based Chandy-Misra-Bryant
//!   with EOT/EIT vectors and null-message advancement
//! - [`controller::SimType::Optimistic`] - Time Warp with antimessages, state
//!   saving and a Mattern-style GVT computed on a dedicated thread
//!
//! ## Architecture
//!
//! - [`model`] - the atomic-model trait and its support types
//! - [`root`] - coupled hierarchies and direct-connect flattening
//! - [`core`] - the per-worker engines
//! - [`controller`] - configuration and run orchestration
//! - [`network`] / [`scheduler`] / [`gvt`] - transport, scheduling and the
//!   GVT ring

use thiserror::Error;

pub mod allocator;
pub mod controller;
pub mod core;
pub mod gvt;
pub mod message;
pub mod model;
pub mod network;
pub mod root;
pub mod scheduler;
pub mod termination;
#[cfg(test)]
pub(crate) mod testmodels;
pub mod time;
pub mod tracer;

pub mod prelude {
    pub use crate::allocator::{AllocRequest, Allocator, RoundRobin};
    pub use crate::controller::{Controller, GvtFailure, SimConfig, SimSummary, SimType};
    pub use crate::message::{Message, ModelUuid, PortId};
    pub use crate::model::{
        AtomicModel, DsContext, ModelSpec, ModelView, OutputBag, PortEvent, SavedState, ZFunc,
    };
    pub use crate::root::{CoupledModel, RootModel};
    pub use crate::termination::TerminationCheck;
    pub use crate::time::Timestamp;
    pub use crate::tracer::{CollectTracer, TraceKind, TraceRecord, Tracer, TracerSet};
    pub use crate::SimError;
}

/// The one error surface of the crate. Kind plus context; model and core
/// identifiers are carried in the message where they are known.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("model contract violation: {0}")]
    ModelContract(String),
    #[error("scheduler invariant violated: {0}")]
    SchedulingInvariant(String),
    #[error("GVT protocol failure: {0}")]
    GvtProtocol(String),
    #[error("network fault: {0}")]
    Network(String),
    #[error("dynamic-structure phase violation: {0}")]
    DsPhase(String),
    #[error("allocator assigned model `{model}` to core {assigned}, but only {cores} cores exist")]
    Allocator {
        model: String,
        assigned: usize,
        cores: usize,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("worker thread for core {0} panicked")]
    ThreadPanic(usize),
}
