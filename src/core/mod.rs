//! The per-core PDEVS state machine shared by all three engines: a model
//! table, the scheduler keyed by next internal transition time, a local clock
//! and the output-route-transition small step. The optimistic and
//! conservative engines wrap this base and layer their synchronization on
//! top.

pub mod conservative;
pub mod optimistic;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::message::{Color, Message, ModelUuid, MsgFlags, PortId};
use crate::model::{AtomicModel, ModelView, OutputBag, PortEvent, SavedState, ZFunc};
use crate::scheduler::ModelScheduler;
use crate::termination::{TerminationCheck, TerminationTime};
use crate::time::Timestamp;
use crate::tracer::{TraceKind, TraceRecord, TracerSet};
use crate::SimError;

/// A resolved direct-connect edge out of one of this core's models.
pub(crate) struct Link<P> {
    pub dst: ModelUuid,
    pub dst_port: PortId,
    pub z: Option<ZFunc<P>>,
}

/// Saved snapshot of one model at one transition, for rollback.
pub(crate) struct StateRecord {
    pub time_last: Timestamp,
    pub time_next: Timestamp,
    pub state: SavedState,
}

/// One entry in the core's model table.
pub(crate) struct ModelSlot<P> {
    pub name: String,
    pub model: Box<dyn AtomicModel<P>>,
    pub time_last: Timestamp,
    pub time_next: Timestamp,
    /// Outgoing edges per output port.
    pub links: Vec<Vec<Link<P>>>,
    /// Rollback history, newest last. Maintained only when the core keeps
    /// old states (optimistic engine).
    pub history: Vec<StateRecord>,
}

/// A single simulation core: owns a disjoint subset of the models and drives
/// them through output-route-transition cycles.
pub struct Core<P> {
    pub(crate) id: usize,
    pub(crate) slots: Vec<ModelSlot<P>>,
    pub(crate) scheduler: ModelScheduler,
    pub(crate) time: Timestamp,
    live: Arc<AtomicBool>,
    pub(crate) term: TerminationTime,
    term_check: Option<TerminationCheck>,
    pub(crate) terminated_by_functor: bool,
    pub(crate) zombie_rounds: u32,
    keep_states: bool,
    pub(crate) tracers: TracerSet,
    /// Models found imminent for the current step.
    pub(crate) imminent: Vec<usize>,
    /// Models that transitioned in the last step, harvested by the
    /// dynamic-structure loop.
    pub(crate) last_transitioned: Vec<usize>,
    /// Messages to hand to this step's transitions, keyed by local id.
    pub(crate) mailbag: BTreeMap<usize, Vec<Message<P>>>,
}

impl<P: Clone> Core<P> {
    pub(crate) fn new(
        id: usize,
        term: TerminationTime,
        term_check: Option<TerminationCheck>,
        tracers: TracerSet,
        keep_states: bool,
    ) -> Self {
        Self {
            id,
            slots: Vec::new(),
            scheduler: ModelScheduler::new(),
            time: Timestamp::zero(),
            live: Arc::new(AtomicBool::new(false)),
            term,
            term_check,
            terminated_by_functor: false,
            zombie_rounds: 0,
            keep_states,
            tracers,
            imminent: Vec::new(),
            last_transitioned: Vec::new(),
            mailbag: BTreeMap::new(),
        }
    }

    pub(crate) fn add_model(
        &mut self,
        name: String,
        model: Box<dyn AtomicModel<P>>,
        links: Vec<Vec<Link<P>>>,
    ) -> usize {
        let local = self.slots.len();
        self.slots.push(ModelSlot {
            name,
            model,
            time_last: Timestamp::zero(),
            time_next: Timestamp::infinity(),
            links,
            history: Vec::new(),
        });
        local
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Cross-thread handle to this core's live flag, used by the workers'
    /// all-idle check.
    pub(crate) fn live_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }

    pub(crate) fn zombie_rounds(&self) -> u32 {
        self.zombie_rounds
    }

    /// Prime every model: establish `time_next = time_last + time_advance`,
    /// load the scheduler, take the initial state snapshot.
    pub(crate) fn init(&mut self) {
        self.set_live(true);
        for local in 0..self.slots.len() {
            let slot = &mut self.slots[local];
            slot.time_last = Timestamp::zero();
            slot.time_next = slot.time_last.advance(slot.model.time_advance());
            self.scheduler.schedule(local, slot.time_next);
            if self.keep_states {
                slot.history.clear();
                slot.history.push(StateRecord {
                    time_last: slot.time_last,
                    time_next: slot.time_next,
                    state: slot.model.save_state(),
                });
            }
            self.tracers.record(TraceRecord {
                time: Timestamp::zero(),
                core: self.id,
                model: slot.name.clone(),
                kind: TraceKind::Init,
                state: slot.model.describe(),
            });
        }
        debug!(
            "core {}: initialized {} models, first event at {}",
            self.id,
            self.slots.len(),
            self.scheduler.top_time()
        );
    }

    /// Fill `self.imminent` with every model due at the current time.
    pub(crate) fn find_imminent(&mut self) {
        self.imminent.clear();
        self.scheduler.find_until(self.time, &mut self.imminent);
    }

    /// Collect the output of every imminent model and route it through the
    /// direct-connect edges into `sink`, destination core already set.
    /// Message timestamps carry a causality bump past the current time.
    pub(crate) fn collect_output(
        &mut self,
        sink: &mut Vec<Message<P>>,
    ) -> Result<(), SimError> {
        let stamp = self.time.advance(Timestamp::epsilon());
        let mut bag = OutputBag::new();
        for idx in 0..self.imminent.len() {
            let local = self.imminent[idx];
            let slot = &self.slots[local];
            slot.model.output(&mut bag);
            for (port, payload) in bag.drain() {
                let links = slot.links.get(port.0 as usize).ok_or_else(|| {
                    SimError::ModelContract(format!(
                        "model `{}` on core {} emitted on undeclared output port {}",
                        slot.name, self.id, port.0
                    ))
                })?;
                for link in links {
                    let payload = match &link.z {
                        Some(z) => z(payload.clone()),
                        None => payload.clone(),
                    };
                    sink.push(Message {
                        src: ModelUuid::new(self.id, local),
                        src_port: port,
                        dst: link.dst,
                        dst_port: link.dst_port,
                        timestamp: stamp,
                        color: Color::White,
                        flags: MsgFlags::default(),
                        payload,
                    });
                }
            }
        }
        Ok(())
    }

    /// Queue a message for delivery to one of this core's models in the
    /// current step.
    pub(crate) fn deliver_local(&mut self, msg: Message<P>) {
        debug_assert_eq!(msg.dst.core, self.id);
        self.mailbag.entry(msg.dst.local).or_default().push(msg);
    }

    /// Run the matching transition for every model that is imminent, has
    /// mail, or both. Returns the delivered messages so the optimistic core
    /// can append them to its processed log.
    pub(crate) fn transition(&mut self) -> Result<Vec<Message<P>>, SimError> {
        let mut due: Vec<usize> = self.imminent.clone();
        for &local in self.mailbag.keys() {
            if !self.imminent.contains(&local) {
                due.push(local);
            }
        }
        due.sort_unstable();
        self.last_transitioned.clear();

        let mut delivered = Vec::new();
        for local in due {
            let internal = self.imminent.contains(&local);
            let mut mail = self.mailbag.remove(&local).unwrap_or_default();
            mail.sort();
            let inputs: Vec<PortEvent<P>> = mail
                .iter()
                .map(|m| PortEvent {
                    port: m.dst_port,
                    payload: m.payload.clone(),
                })
                .collect();

            let slot = &mut self.slots[local];
            let kind = match (internal, !inputs.is_empty()) {
                (true, false) => {
                    trace!("core {}: internal transition of `{}` at {}", self.id, slot.name, self.time);
                    slot.model.internal_transition();
                    TraceKind::Internal
                }
                (false, true) => {
                    let elapsed = self.time.since(slot.time_last);
                    trace!("core {}: external transition of `{}` at {}", self.id, slot.name, self.time);
                    slot.model.external_transition(elapsed, &inputs);
                    TraceKind::External
                }
                (true, true) => {
                    trace!("core {}: confluent transition of `{}` at {}", self.id, slot.name, self.time);
                    slot.model.confluent_transition(&inputs);
                    TraceKind::Confluent
                }
                (false, false) => continue,
            };

            slot.time_last = self.time;
            slot.time_next = slot.time_last.advance(slot.model.time_advance());
            self.scheduler.schedule(local, slot.time_next);
            self.last_transitioned.push(local);
            if self.keep_states {
                slot.history.push(StateRecord {
                    time_last: slot.time_last,
                    time_next: slot.time_next,
                    state: slot.model.save_state(),
                });
            }
            self.tracers.record(TraceRecord {
                time: self.time,
                core: self.id,
                model: slot.name.clone(),
                kind,
                state: slot.model.describe(),
            });
            delivered.extend(mail);
        }
        Ok(delivered)
    }

    /// Advance the local clock to the next event: the earliest of the
    /// scheduler top and `pending_min` (the earliest undelivered message).
    /// Returns false when the core has gone idle, either because nothing is
    /// left or because the termination time was reached.
    pub(crate) fn sync_time(&mut self, pending_min: Timestamp) -> bool {
        let next = self.scheduler.top_time().min(pending_min);
        if next.is_infinite() {
            trace!("core {}: nothing scheduled, going idle", self.id);
            return false;
        }
        debug_assert!(next >= self.time, "core clock ran backwards");
        if self.term.reached(next) {
            self.time = self.term.get();
            debug!("core {}: termination time {} reached", self.id, self.time);
            return false;
        }
        self.time = next;
        true
    }

    /// Evaluate the termination functor, broadcasting the local time as the
    /// new bound when it fires.
    pub(crate) fn check_termination_functor(&mut self) {
        let check = match &self.term_check {
            Some(check) => Arc::clone(check),
            None => return,
        };
        let views = self.views();
        if check(&views) {
            debug!(
                "core {}: termination functor fired at {}",
                self.id, self.time
            );
            self.terminated_by_functor = true;
            self.term.broadcast(self.time);
            self.set_live(false);
        }
    }

    /// One sequential small step: imminents, output, local routing,
    /// transitions, clock advance, termination checks.
    pub(crate) fn small_step(&mut self) -> Result<(), SimError> {
        self.find_imminent();
        let mut routed = Vec::new();
        self.collect_output(&mut routed)?;
        for msg in routed {
            self.deliver_local(msg);
        }
        let had_work = !self.imminent.is_empty() || !self.mailbag.is_empty();
        if had_work {
            self.zombie_rounds = 0;
        } else {
            self.zombie_rounds += 1;
        }
        self.transition()?;
        self.imminent.clear();
        self.check_termination_functor();
        if !self.sync_time(Timestamp::infinity()) {
            self.set_live(false);
        }
        Ok(())
    }

    /// Rebuild the scheduler from the model table. Safe to call repeatedly;
    /// two back-to-back calls leave identical contents.
    pub(crate) fn validate_models(&mut self) {
        let entries: Vec<(usize, Timestamp)> = self
            .slots
            .iter()
            .enumerate()
            .map(|(local, slot)| (local, slot.time_next))
            .collect();
        self.scheduler.rebuild(entries.into_iter());
        self.imminent.clear();
    }

    /// Restore every model to its newest saved state strictly older than
    /// `to`, then rebuild the scheduler.
    pub(crate) fn revert_models(&mut self, to: Timestamp) {
        for slot in self.slots.iter_mut() {
            while slot.history.len() > 1 {
                let tail = slot.history.last().expect("history non-empty");
                if tail.time_last >= to {
                    slot.history.pop();
                } else {
                    break;
                }
            }
            let tail = match slot.history.last() {
                Some(t) => t,
                None => continue,
            };
            if slot.time_last != tail.time_last || slot.time_next != tail.time_next {
                slot.model.restore_state(&tail.state);
                slot.time_last = tail.time_last;
                slot.time_next = tail.time_next;
            }
        }
        self.time = to;
        self.validate_models();
    }

    /// Drop per-model history older than the new GVT, keeping the newest
    /// record at or before it as the rollback base.
    pub(crate) fn prune_history(&mut self, gvt: Timestamp) {
        for slot in self.slots.iter_mut() {
            let keep_from = slot
                .history
                .iter()
                .rposition(|r| r.time_last.time < gvt.time)
                .unwrap_or(0);
            if keep_from > 0 {
                slot.history.drain(..keep_from);
            }
        }
    }

    pub(crate) fn views(&self) -> Vec<ModelView> {
        self.slots
            .iter()
            .enumerate()
            .map(|(local, slot)| ModelView {
                name: slot.name.clone(),
                uuid: ModelUuid::new(self.id, local),
                time_last: slot.time_last,
                time_next: slot.time_next,
                state: slot.model.describe(),
            })
            .collect()
    }

    /// Take the model boxes out of the core, for a DS-phase re-flatten.
    pub(crate) fn take_models(
        &mut self,
    ) -> Vec<(String, Box<dyn AtomicModel<P>>, Timestamp, Timestamp)> {
        let slots = std::mem::take(&mut self.slots);
        self.scheduler = ModelScheduler::new();
        slots
            .into_iter()
            .map(|s| (s.name, s.model, s.time_last, s.time_next))
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testmodels::TrafficLight;
    use crate::tracer::CollectTracer;

    fn light_core(term: u64) -> (Core<u32>, std::sync::Arc<std::sync::Mutex<Vec<TraceRecord>>>) {
        let tracers = TracerSet::new();
        let (tracer, records) = CollectTracer::new();
        tracers.attach(Box::new(tracer));
        let mut core = Core::new(
            0,
            TerminationTime::new(Timestamp::from_time(term)),
            None,
            tracers,
            false,
        );
        core.add_model("light".into(), Box::new(TrafficLight::new()), vec![Vec::new()]);
        core.init();
        (core, records)
    }

    #[test]
    fn traffic_light_cycles_until_termination() {
        // red(60) -> green(50) -> yellow(10), stop at 360
        let (mut core, records) = light_core(360);
        while core.is_live() {
            core.small_step().unwrap();
        }
        core.tracers.flush_until(Timestamp::infinity());
        let records = records.lock().unwrap();
        let transitions: Vec<(u64, String)> = records
            .iter()
            .filter(|r| r.kind == TraceKind::Internal)
            .map(|r| (r.time.time, r.state.clone()))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (60, "green".into()),
                (110, "yellow".into()),
                (120, "red".into()),
                (180, "green".into()),
                (230, "yellow".into()),
                (240, "red".into()),
                (300, "green".into()),
                (350, "yellow".into()),
            ]
        );
        // no transition at or past the termination time
        assert!(transitions.iter().all(|(t, _)| *t < 360));
        assert_eq!(core.time(), Timestamp::from_time(360));
    }

    #[test]
    fn validate_models_is_idempotent() {
        let (mut core, _) = light_core(360);
        core.small_step().unwrap();
        core.validate_models();
        let top = core.scheduler.top_time();
        let len = core.scheduler.len();
        core.validate_models();
        assert_eq!(core.scheduler.top_time(), top);
        assert_eq!(core.scheduler.len(), len);
    }

    #[test]
    fn zero_time_advance_resolves_through_causality() {
        struct Burst {
            remaining: u32,
        }
        impl AtomicModel<u32> for Burst {
            fn time_advance(&self) -> Timestamp {
                if self.remaining > 0 {
                    Timestamp::zero()
                } else {
                    Timestamp::infinity()
                }
            }
            fn output(&self, _bag: &mut OutputBag<u32>) {}
            fn internal_transition(&mut self) {
                self.remaining -= 1;
            }
            fn external_transition(&mut self, _e: Timestamp, _i: &[PortEvent<u32>]) {}
            fn describe(&self) -> String {
                self.remaining.to_string()
            }
        }

        let tracers = TracerSet::new();
        let (tracer, records) = CollectTracer::new();
        tracers.attach(Box::new(tracer));
        let mut core = Core::new(
            0,
            TerminationTime::new(Timestamp::from_time(10)),
            None,
            tracers,
            false,
        );
        core.add_model("burst".into(), Box::new(Burst { remaining: 3 }), vec![]);
        core.init();
        let mut guard = 0;
        while core.is_live() {
            core.small_step().unwrap();
            guard += 1;
            assert!(guard < 20, "zero-delay chain failed to drain");
        }
        // all three transitions happen at real time zero
        core.tracers.flush_until(Timestamp::infinity());
        let records = records.lock().unwrap();
        let internals: Vec<Timestamp> = records
            .iter()
            .filter(|r| r.kind == TraceKind::Internal)
            .map(|r| r.time)
            .collect();
        assert_eq!(internals.len(), 3);
        assert!(internals.iter().all(|t| t.time == 0));
        assert_eq!(core.time().time, 0);
    }

    #[test]
    fn emission_on_undeclared_port_is_a_contract_error() {
        struct Wild;
        impl AtomicModel<u32> for Wild {
            fn time_advance(&self) -> Timestamp {
                Timestamp::from_time(5)
            }
            fn output(&self, bag: &mut OutputBag<u32>) {
                bag.emit(PortId(7), 1);
            }
            fn internal_transition(&mut self) {}
            fn external_transition(&mut self, _e: Timestamp, _i: &[PortEvent<u32>]) {}
        }

        let mut core = Core::new(
            0,
            TerminationTime::new(Timestamp::from_time(100)),
            None,
            TracerSet::new(),
            false,
        );
        core.add_model("wild".into(), Box::new(Wild), vec![]);
        core.init();
        core.small_step().unwrap(); // advance to t=5
        let err = core.small_step().unwrap_err();
        assert!(matches!(err, SimError::ModelContract(_)));
    }

    #[test]
    fn functor_termination_broadcasts_time() {
        let tracers = TracerSet::new();
        let term = TerminationTime::new(Timestamp::from_time(10_000));
        let check: TerminationCheck =
            Arc::new(|views: &[ModelView]| views.iter().any(|v| v.state == "yellow"));
        let mut core = Core::new(0, term.clone(), Some(check), tracers, false);
        core.add_model("light".into(), Box::new(TrafficLight::new()), vec![Vec::new()]);
        core.init();
        while core.is_live() {
            core.small_step().unwrap();
        }
        // first yellow is entered at t=110
        assert!(core.terminated_by_functor);
        assert_eq!(term.get(), Timestamp::from_time(110));
    }
}
