//! Maps flattened atomic models onto cores. Parallel engines require every
//! model to be allocated before the first step.

use crate::SimError;

/// What the allocator gets to see of a model: its name and an optional core
/// request carried over from registration.
#[derive(Clone, Debug)]
pub struct AllocRequest {
    pub name: String,
    pub requested_core: Option<usize>,
}

/// Assignment strategy. `allocate` returns one core id per model, in model
/// order; ids must be `< cores`, anything else is a fatal allocator error.
pub trait Allocator: Send {
    fn allocate(&mut self, models: &[AllocRequest], cores: usize) -> Vec<usize>;
}

/// Deterministic round-robin. A model that requested a core gets it, modulo
/// the core count; the rest are dealt out in registration order.
#[derive(Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { next: 0 }
    }
}

impl Allocator for RoundRobin {
    fn allocate(&mut self, models: &[AllocRequest], cores: usize) -> Vec<usize> {
        models
            .iter()
            .map(|model| match model.requested_core {
                Some(core) => core % cores,
                None => {
                    let core = self.next % cores;
                    self.next += 1;
                    core
                }
            })
            .collect()
    }
}

/// Validate an allocation against the core count.
pub fn check_allocation(
    models: &[AllocRequest],
    assignment: &[usize],
    cores: usize,
) -> Result<(), SimError> {
    if assignment.len() != models.len() {
        return Err(SimError::Config(format!(
            "allocator produced {} assignments for {} models",
            assignment.len(),
            models.len()
        )));
    }
    for (model, &core) in models.iter().zip(assignment) {
        if core >= cores {
            return Err(SimError::Allocator {
                model: model.name.clone(),
                assigned: core,
                cores,
            });
        }
    }
    Ok(())
}
