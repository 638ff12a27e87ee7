//! The conservative (Chandy-Misra-Bryant) core: every core publishes an
//! earliest-output-time promise and never advances its clock past the
//! earliest input time derived from the cores that can influence it. Stalled
//! cores generate output and null-time announcements so ties at the EIT
//! boundary resolve without deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::network::Network;
use crate::scheduler::MessagePool;
use crate::time::Timestamp;
use crate::SimError;

use super::Core;

/// One-writer-per-slot vector of time values shared between cores. Slot `i`
/// is written only by core `i`; everyone may read.
pub(crate) struct SharedTimeVector {
    slots: Vec<AtomicU64>,
}

impl SharedTimeVector {
    pub(crate) fn new(cores: usize, initial: u64) -> Self {
        Self {
            slots: (0..cores).map(|_| AtomicU64::new(initial)).collect(),
        }
    }

    pub(crate) fn get(&self, core: usize) -> u64 {
        self.slots[core].load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, core: usize, value: u64) {
        self.slots[core].store(value, Ordering::Release);
    }
}

/// A conservatively synchronized core.
pub struct ConservativeCore<P> {
    pub(crate) base: Core<P>,
    net: Arc<Network<P>>,
    eot: Arc<SharedTimeVector>,
    null_t: Arc<SharedTimeVector>,
    /// Cores hosting models with edges into this core, self excluded.
    influencers: Vec<usize>,
    eit: Timestamp,
    min_lookahead: Timestamp,
    lookahead_dirty: bool,
    /// Last time each local model generated output, so a stalled round never
    /// emits twice for the same instant.
    generated_at: HashMap<usize, u64>,
    pending: MessagePool<P>,
}

impl<P: Clone> ConservativeCore<P> {
    pub(crate) fn new(
        base: Core<P>,
        net: Arc<Network<P>>,
        eot: Arc<SharedTimeVector>,
        null_t: Arc<SharedTimeVector>,
        influencers: Vec<usize>,
    ) -> Self {
        Self {
            base,
            net,
            eot,
            null_t,
            influencers,
            eit: Timestamp::infinity(),
            min_lookahead: Timestamp::infinity(),
            lookahead_dirty: true,
            generated_at: HashMap::new(),
            pending: MessagePool::new(),
        }
    }

    pub fn eit(&self) -> Timestamp {
        self.eit
    }

    /// One conservative small step. Returns true when the core made progress
    /// (advanced its clock or transitioned); the worker yields otherwise.
    pub fn small_step(&mut self) -> Result<bool, SimError> {
        if !self.base.is_live() {
            return Ok(false);
        }
        self.update_lookahead()?;

        // Snapshot EOT/null-time before draining: the acquire loads order the
        // drain after every accept a publishing core made before its store,
        // so no message below the snapshot EIT can be missed.
        let (eit, release) = self.snapshot_influencers();
        self.eit = eit;

        for msg in self.net.drain(self.base.id) {
            if msg.timestamp.time < self.base.time.time {
                return Err(SimError::SchedulingInvariant(format!(
                    "conservative core {} received message at {} while at {}",
                    self.base.id, msg.timestamp, self.base.time
                )));
            }
            self.pending.push(msg);
        }

        let now = self.base.time;
        let stalled = !eit.is_infinite() && now.time == eit.time;

        self.base.find_imminent();
        let sent_min = self.emit_output_once()?;

        if stalled {
            // everything this core can say through `now` has been said;
            // null-time is exclusive, so announce now + 1
            self.null_t.set(self.base.id, now.time.saturating_add(1));
            if !release {
                trace!(
                    "core {}: stalled at EIT {} waiting on influencers",
                    self.base.id,
                    eit
                );
                self.update_eot(sent_min);
                return Ok(false);
            }
            debug!("core {}: null-message release at {}", self.base.id, now);
        }

        while let Some(msg) = self.pending.pop_due(now) {
            self.base.deliver_local(msg);
        }
        let transitioned = !self.base.imminent.is_empty() || !self.base.mailbag.is_empty();
        self.base.transition()?;
        self.base.imminent.clear();
        if transitioned {
            self.lookahead_dirty = true;
        }
        self.base.check_termination_functor();

        let mut progress = transitioned;

        let next = self
            .base
            .scheduler
            .top_time()
            .min(self.pending.next_time());
        let goal = next.time.min(eit.time);
        if goal == u64::MAX {
            self.go_idle();
            return Ok(true);
        }
        if goal >= self.base.term.get().time {
            self.base.time = self.base.term.get();
            self.go_idle();
            return Ok(true);
        }
        if goal > now.time {
            progress = true;
        }
        debug_assert!(goal >= now.time, "conservative clock ran backwards");
        self.base.time = Timestamp::from_time(goal);

        self.update_eot(sent_min);
        if !self.base.is_live() {
            self.go_idle();
        }
        Ok(progress)
    }

    /// Collect output for imminent models that have not yet emitted at the
    /// current time, routing local messages into the pending pool and remote
    /// ones to the network with the EOT clamped to the send time.
    fn emit_output_once(&mut self) -> Result<Option<Timestamp>, SimError> {
        let now = self.base.time.time;
        let full: Vec<usize> = self.base.imminent.clone();
        self.base
            .imminent
            .retain(|local| self.generated_at.get(local) != Some(&now));
        for &local in &self.base.imminent {
            self.generated_at.insert(local, now);
        }
        let mut routed = Vec::new();
        let result = self.base.collect_output(&mut routed);
        self.base.imminent = full;
        result?;

        let mut sent_min: Option<Timestamp> = None;
        for msg in routed {
            sent_min = Some(match sent_min {
                Some(prev) => prev.min(msg.timestamp),
                None => msg.timestamp,
            });
            if msg.dst.core == self.base.id {
                self.pending.push(msg);
            } else {
                // receivers must never observe a promise past a message that
                // is still on its way to the network
                let current = self.eot.get(self.base.id);
                self.eot
                    .set(self.base.id, current.min(msg.timestamp.time));
                self.net.accept(msg);
            }
        }
        Ok(sent_min)
    }

    /// EIT is the minimum EOT over influencing cores; the release condition
    /// holds when every influencer has either promised past `now` or
    /// announced that its output at `now` is flushed.
    fn snapshot_influencers(&self) -> (Timestamp, bool) {
        let now = self.base.time.time;
        let mut eit = u64::MAX;
        let mut release = true;
        for &k in &self.influencers {
            let eot = self.eot.get(k);
            eit = eit.min(eot);
            if !(eot > now || self.null_t.get(k) > now) {
                release = false;
            }
        }
        (
            if eit == u64::MAX {
                Timestamp::infinity()
            } else {
                Timestamp::from_time(eit)
            },
            release,
        )
    }

    /// Recompute the minimum lookahead whenever any model's state may have
    /// changed it. Zero lookahead is a contract violation in this engine.
    fn update_lookahead(&mut self) -> Result<(), SimError> {
        if !self.lookahead_dirty {
            return Ok(());
        }
        let mut min_la = Timestamp::infinity();
        for slot in &self.base.slots {
            let la = slot.model.lookahead();
            if la.time == 0 {
                return Err(SimError::ModelContract(format!(
                    "model `{}` on core {} declared a zero lookahead under conservative synchronization",
                    slot.name, self.base.id
                )));
            }
            min_la = min_la.min(la);
        }
        self.min_lookahead = min_la;
        self.lookahead_dirty = false;
        Ok(())
    }

    /// Publish this core's earliest-output promise: the earliest of any
    /// message sent this round, each model's next internal output (pushed
    /// past it by lookahead once that output is flushed), and the bound on
    /// output induced by future input.
    fn update_eot(&mut self, sent_min: Option<Timestamp>) {
        let la = self.min_lookahead.time;
        let now = self.base.time.time;
        let mut cand = now.saturating_add(la);
        for (local, slot) in self.base.slots.iter().enumerate() {
            if slot.time_next.is_infinite() {
                continue;
            }
            let t = slot.time_next.time;
            let contribution = if self.generated_at.get(&local) == Some(&t) {
                t.saturating_add(la)
            } else {
                t
            };
            cand = cand.min(contribution);
        }
        if let Some(sent) = sent_min {
            cand = cand.min(sent.time);
        }
        self.eot.set(self.base.id, cand);
        trace!("core {}: EOT {} at time {}", self.base.id, cand, now);
    }

    /// Worker error path: stop promising anything so peers can still finish.
    pub(crate) fn abandon(&mut self) {
        self.go_idle();
    }

    fn go_idle(&mut self) {
        self.base.set_live(false);
        self.eot.set(self.base.id, u64::MAX);
        self.null_t.set(self.base.id, u64::MAX);
        debug!("core {}: idle at {}", self.base.id, self.base.time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Link;
    use crate::message::{ModelUuid, PortId};
    use crate::termination::TerminationTime;
    use crate::testmodels::{Policeman, TrafficLight};
    use crate::tracer::{CollectTracer, TraceKind, TracerSet};

    fn scenario_two() -> (
        ConservativeCore<u32>,
        ConservativeCore<u32>,
        std::sync::Arc<std::sync::Mutex<Vec<crate::tracer::TraceRecord>>>,
    ) {
        let net = Arc::new(Network::new(2));
        let eot = Arc::new(SharedTimeVector::new(2, 0));
        let null_t = Arc::new(SharedTimeVector::new(2, 0));
        let term = TerminationTime::new(Timestamp::from_time(360));
        let tracers = TracerSet::new();
        let (tracer, records) = CollectTracer::new();
        tracers.attach(Box::new(tracer));

        let mut police = Core::new(0, term.clone(), None, tracers.clone(), false);
        police.add_model(
            "police".into(),
            Box::new(Policeman::new()),
            vec![vec![Link {
                dst: ModelUuid::new(1, 0),
                dst_port: PortId(0),
                z: None,
            }]],
        );
        police.init();
        let mut light = Core::new(1, term.clone(), None, tracers.clone(), false);
        light.add_model("light".into(), Box::new(TrafficLight::new()), vec![Vec::new()]);
        light.init();

        let police = ConservativeCore::new(
            police,
            Arc::clone(&net),
            Arc::clone(&eot),
            Arc::clone(&null_t),
            Vec::new(),
        );
        let light = ConservativeCore::new(
            light,
            Arc::clone(&net),
            Arc::clone(&eot),
            Arc::clone(&null_t),
            vec![0],
        );
        (police, light, records)
    }

    #[test]
    fn policeman_interrupts_the_light_without_passing_eit() {
        // the policeman/light pair, interleaved on one thread
        let (mut police, mut light, records) = scenario_two();
        let mut rounds = 0;
        while police.base.is_live() || light.base.is_live() {
            police.small_step().unwrap();
            light.small_step().unwrap();
            // the cardinal conservative invariant
            assert!(light.base.time().time <= light.eit().time);
            rounds += 1;
            assert!(rounds < 10_000, "conservative pair failed to converge");
        }
        light.base.tracers.flush_until(Timestamp::infinity());
        let records = records.lock().unwrap();
        let externals: Vec<(u64, String)> = records
            .iter()
            .filter(|r| r.model == "light" && r.kind == TraceKind::External)
            .map(|r| (r.time.time, r.state.clone()))
            .collect();
        assert_eq!(
            externals,
            vec![(200, "manual".to_string()), (300, "red".to_string())]
        );
        assert_eq!(light.base.time(), Timestamp::from_time(360));
        // the policeman runs out of events at 300 and idles there
        assert_eq!(police.base.time(), Timestamp::from_time(300));
    }

    #[test]
    fn light_never_transitions_past_a_lagging_policeman() {
        // run only the light; the policeman never steps, so its EOT stays 0
        let (_police, mut light, _records) = scenario_two();
        for _ in 0..50 {
            let progress = light.small_step().unwrap();
            assert!(light.base.time().time <= 0, "advanced past EIT");
            let _ = progress;
        }
    }

    #[test]
    fn zero_lookahead_is_rejected() {
        use crate::model::{AtomicModel, OutputBag, PortEvent};

        struct ZeroLa;
        impl AtomicModel<u32> for ZeroLa {
            fn time_advance(&self) -> Timestamp {
                Timestamp::from_time(10)
            }
            fn output(&self, _bag: &mut OutputBag<u32>) {}
            fn internal_transition(&mut self) {}
            fn external_transition(&mut self, _e: Timestamp, _i: &[PortEvent<u32>]) {}
            fn lookahead(&self) -> Timestamp {
                Timestamp::zero()
            }
        }

        let net = Arc::new(Network::new(1));
        let eot = Arc::new(SharedTimeVector::new(1, 0));
        let null_t = Arc::new(SharedTimeVector::new(1, 0));
        let term = TerminationTime::new(Timestamp::from_time(100));
        let mut core = Core::new(0, term, None, TracerSet::new(), false);
        core.add_model("z".into(), Box::new(ZeroLa), vec![]);
        core.init();
        let mut core = ConservativeCore::new(core, net, eot, null_t, Vec::new());
        let err = core.small_step().unwrap_err();
        assert!(matches!(err, SimError::ModelContract(_)));
    }

    #[test]
    fn idle_core_promises_infinity() {
        let (mut police, _light, _records) = scenario_two();
        let mut guard = 0;
        while police.base.is_live() {
            police.small_step().unwrap();
            guard += 1;
            assert!(guard < 1_000);
        }
        assert_eq!(police.eot.get(0), u64::MAX);
        assert_eq!(police.null_t.get(0), u64::MAX);
    }
}
