//! Simulation orchestration: configuration, core construction and the four
//! engine loops. The controller flattens the model hierarchy, allocates
//! models to cores, spawns one worker thread per core (plus the GVT thread
//! for Time Warp), and enforces termination and the worker exit barrier.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::allocator::{check_allocation, AllocRequest, Allocator, RoundRobin};
use crate::core::conservative::{ConservativeCore, SharedTimeVector};
use crate::core::optimistic::{GvtShared, OptimisticCore};
use crate::core::{Core, Link};
use crate::gvt::{publish, run_round, RoundOutcome};
use crate::message::ModelUuid;
use crate::model::{DsContext, ModelView};
use crate::network::Network;
use crate::root::{FlatModel, RootModel};
use crate::termination::{TerminationCheck, TerminationTime};
use crate::time::Timestamp;
use crate::tracer::TracerSet;
use crate::SimError;

/// Synchronization strategy, fixed for the lifetime of a run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SimType {
    Sequential,
    DynamicStructure,
    Optimistic,
    Conservative,
}

/// What to do when a Mattern round fails twice, or the GVT regresses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GvtFailure {
    /// Log, stop computing GVT, let the simulation run to termination.
    /// Memory is no longer reclaimed.
    ContinueWithoutGvt,
    /// Surface a `GvtProtocol` error from `simulate`.
    Abort,
}

/// Run configuration. Build with `new` plus the `with_*` methods; `validate`
/// runs at controller construction.
pub struct SimConfig {
    pub sim_type: SimType,
    pub cores: usize,
    pub termination_time: Timestamp,
    pub termination_check: Option<TerminationCheck>,
    pub gvt_interval: Duration,
    pub gvt_cap: u64,
    pub gvt_failure: GvtFailure,
    pub zombie_threshold: u32,
    pub save_interval: u64,
    pub loop_cap: u64,
    pub allocator: Box<dyn Allocator>,
}

impl SimConfig {
    pub fn new(sim_type: SimType) -> Self {
        Self {
            sim_type,
            cores: 1,
            termination_time: Timestamp::infinity(),
            termination_check: None,
            gvt_interval: Duration::from_millis(200),
            gvt_cap: 1_000_000,
            gvt_failure: GvtFailure::ContinueWithoutGvt,
            zombie_threshold: 10,
            save_interval: 5,
            loop_cap: 10_000_000,
            allocator: Box::new(RoundRobin::new()),
        }
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_termination_time(mut self, time: Timestamp) -> Self {
        self.termination_time = time;
        self
    }

    pub fn with_termination_check(mut self, check: TerminationCheck) -> Self {
        self.termination_check = Some(check);
        self
    }

    pub fn with_gvt_interval(mut self, interval: Duration) -> Self {
        self.gvt_interval = interval;
        self
    }

    pub fn with_gvt_cap(mut self, cap: u64) -> Self {
        self.gvt_cap = cap;
        self
    }

    pub fn with_gvt_failure(mut self, policy: GvtFailure) -> Self {
        self.gvt_failure = policy;
        self
    }

    pub fn with_zombie_threshold(mut self, threshold: u32) -> Self {
        self.zombie_threshold = threshold;
        self
    }

    pub fn with_save_interval(mut self, interval: u64) -> Self {
        self.save_interval = interval.max(1);
        self
    }

    pub fn with_loop_cap(mut self, cap: u64) -> Self {
        self.loop_cap = cap;
        self
    }

    pub fn with_allocator(mut self, allocator: Box<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.cores == 0 {
            return Err(SimError::Config("core count must be at least 1".into()));
        }
        match self.sim_type {
            SimType::Sequential | SimType::DynamicStructure => {
                if self.cores != 1 {
                    return Err(SimError::Config(format!(
                        "{:?} simulation runs on exactly one core, {} configured",
                        self.sim_type, self.cores
                    )));
                }
            }
            SimType::Optimistic | SimType::Conservative => {
                let hardware = thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .max(2);
                if self.cores > hardware {
                    return Err(SimError::Config(format!(
                        "{} cores configured but only {} hardware threads available",
                        self.cores, hardware
                    )));
                }
            }
        }
        if self.termination_time.is_infinite() && self.termination_check.is_none() {
            return Err(SimError::Config(
                "no termination time and no termination functor; the run would never end".into(),
            ));
        }
        if self.gvt_interval.is_zero() {
            return Err(SimError::Config("GVT interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// What a finished run hands back: final model views, per-core clocks, the
/// last agreed GVT and the rollback count (optimistic only).
pub struct SimSummary {
    pub views: Vec<ModelView>,
    pub core_times: Vec<Timestamp>,
    pub gvt: Option<Timestamp>,
    pub reverts: u64,
}

impl SimSummary {
    pub fn view(&self, name: &str) -> Option<&ModelView> {
        self.views.iter().find(|v| v.name == name)
    }
}

/// Owns the model root, the tracer set and the configuration, and drives one
/// simulation run.
pub struct Controller<P> {
    config: SimConfig,
    root: RootModel<P>,
    tracers: TracerSet,
    term: TerminationTime,
}

struct BuiltCores<P> {
    cores: Vec<Core<P>>,
    influencers: Vec<Vec<usize>>,
}

impl<P: Clone + Send + 'static> Controller<P> {
    pub fn new(
        config: SimConfig,
        root: RootModel<P>,
        tracers: TracerSet,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let term = TerminationTime::new(config.termination_time);
        Ok(Self {
            config,
            root,
            tracers,
            term,
        })
    }

    /// Run the simulation to completion. The engine was fixed at
    /// construction; a controller drives exactly one run.
    pub fn simulate(&mut self) -> Result<SimSummary, SimError> {
        info!(
            "controller: starting {:?} run on {} core(s), termination {}",
            self.config.sim_type, self.config.cores, self.config.termination_time
        );
        match self.config.sim_type {
            SimType::Sequential => self.run_sequential(false),
            SimType::DynamicStructure => self.run_sequential(true),
            SimType::Optimistic => self.run_optimistic(),
            SimType::Conservative => self.run_conservative(),
        }
    }

    /// Flatten, allocate and populate the cores.
    fn build_cores(&mut self, keep_states: bool) -> Result<BuiltCores<P>, SimError> {
        let flat = self.root.flatten(HashMap::new())?;
        let core_count = self.config.cores;

        let requests: Vec<AllocRequest> = flat
            .atoms
            .iter()
            .map(|a| AllocRequest {
                name: a.name.clone(),
                requested_core: a.requested_core,
            })
            .collect();
        let assignment = self.config.allocator.allocate(&requests, core_count);
        check_allocation(&requests, &assignment, core_count)?;

        let mut local = vec![0usize; flat.atoms.len()];
        let mut filled = vec![0usize; core_count];
        for (i, &core) in assignment.iter().enumerate() {
            local[i] = filled[core];
            filled[core] += 1;
        }

        let FlatModel { atoms, links } = flat;
        let mut influencer_sets: Vec<HashSet<usize>> = vec![HashSet::new(); core_count];
        for link in &links {
            let (src_core, dst_core) = (assignment[link.src], assignment[link.dst]);
            if src_core != dst_core {
                influencer_sets[dst_core].insert(src_core);
            }
        }
        let mut grouped: Vec<Vec<Vec<Link<P>>>> = atoms
            .iter()
            .map(|a| (0..a.outputs.len()).map(|_| Vec::new()).collect())
            .collect();
        for link in links {
            grouped[link.src][link.src_port.0 as usize].push(Link {
                dst: ModelUuid::new(assignment[link.dst], local[link.dst]),
                dst_port: link.dst_port,
                z: link.z,
            });
        }

        let mut cores: Vec<Core<P>> = (0..core_count)
            .map(|id| {
                Core::new(
                    id,
                    self.term.clone(),
                    self.config.termination_check.clone(),
                    self.tracers.clone(),
                    keep_states,
                )
            })
            .collect();
        for (i, atom) in atoms.into_iter().enumerate() {
            let links = std::mem::take(&mut grouped[i]);
            let assigned = cores[assignment[i]].add_model(atom.name, atom.model, links);
            debug_assert_eq!(assigned, local[i]);
        }
        for core in cores.iter_mut() {
            core.init();
        }

        let influencers = influencer_sets
            .into_iter()
            .map(|set| {
                let mut v: Vec<usize> = set.into_iter().collect();
                v.sort_unstable();
                v
            })
            .collect();
        Ok(BuiltCores { cores, influencers })
    }

    fn summary_from(cores: &[&Core<P>], gvt: Option<Timestamp>, reverts: u64) -> SimSummary {
        let mut views = Vec::new();
        let mut core_times = Vec::new();
        for core in cores {
            views.extend(core.views());
            core_times.push(core.time());
        }
        SimSummary {
            views,
            core_times,
            gvt,
            reverts,
        }
    }

    // ------------------------- sequential / DS -------------------------

    fn run_sequential(&mut self, dynamic: bool) -> Result<SimSummary, SimError> {
        let mut built = self.build_cores(false)?;
        let mut core = built.cores.pop().expect("one core");
        let mut turns: u64 = 0;
        while core.is_live() {
            if turns >= self.config.loop_cap {
                warn!("controller: loop cap {} reached, stopping", turns);
                core.set_live(false);
                break;
            }
            turns += 1;
            core.small_step()?;
            if dynamic {
                self.ds_round(&mut core)?;
                if core.zombie_rounds() > 1 {
                    warn!("controller: dynamic-structure core went zombie, stopping");
                    break;
                }
            }
            if turns % self.config.save_interval == 0 {
                self.tracers.flush_until(core.time());
            }
        }
        self.tracers.flush_until(Timestamp::infinity());
        Ok(Self::summary_from(&[&core], None, 0))
    }

    /// After a sequential step, offer `model_transition` to every model that
    /// just transitioned; when any structure change is requested, apply it,
    /// re-run direct connect and rebuild the core's tables.
    fn ds_round(&mut self, core: &mut Core<P>) -> Result<(), SimError> {
        let mut ctx = DsContext::new();
        let mut flagged = false;
        let transitioned = core.last_transitioned.clone();
        for local in transitioned {
            flagged |= core.slots[local].model.model_transition(&mut ctx);
        }
        if !flagged && ctx.is_empty() {
            return Ok(());
        }
        debug!("controller: dynamic-structure phase at {}", core.time());
        self.root.apply_requests(ctx.take_requests())?;

        let mut boxes = HashMap::new();
        let mut times = HashMap::new();
        for (name, model, time_last, time_next) in core.take_models() {
            boxes.insert(name.clone(), model);
            times.insert(name, (time_last, time_next));
        }
        let FlatModel { atoms, links } = self.root.flatten(boxes)?;
        let mut grouped: Vec<Vec<Vec<Link<P>>>> = atoms
            .iter()
            .map(|a| (0..a.outputs.len()).map(|_| Vec::new()).collect())
            .collect();
        for link in links {
            grouped[link.src][link.src_port.0 as usize].push(Link {
                dst: ModelUuid::new(0, link.dst),
                dst_port: link.dst_port,
                z: link.z,
            });
        }
        let now = core.time();
        for (i, atom) in atoms.into_iter().enumerate() {
            let links = std::mem::take(&mut grouped[i]);
            let local = core.add_model(atom.name, atom.model, links);
            let slot = &mut core.slots[local];
            match times.get(&slot.name) {
                Some(&(time_last, time_next)) => {
                    slot.time_last = time_last;
                    slot.time_next = time_next;
                }
                None => {
                    // a model born mid-run starts its clock now
                    slot.time_last = now;
                    slot.time_next = slot.time_last.advance(slot.model.time_advance());
                }
            }
        }
        core.validate_models();
        Ok(())
    }

    // ----------------------------- optimistic -----------------------------

    fn run_optimistic(&mut self) -> Result<SimSummary, SimError> {
        let built = self.build_cores(true)?;
        let core_count = self.config.cores;
        let net: Arc<Network<P>> = Arc::new(Network::new(core_count));
        let shares: Vec<Arc<GvtShared>> = (0..core_count)
            .map(|i| Arc::new(GvtShared::new(i, core_count)))
            .collect();
        let lives: Arc<Vec<_>> =
            Arc::new(built.cores.iter().map(|c| c.live_handle()).collect());
        let rungvt = Arc::new(AtomicBool::new(true));
        let abort = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new((Mutex::new(core_count as i64), Condvar::new()));

        let mut handles = Vec::with_capacity(core_count);
        for core in built.cores {
            let id = core.id();
            let worker = OptimisticCore::new(core, Arc::clone(&net), Arc::clone(&shares[id]));
            let lives = Arc::clone(&lives);
            let rungvt = Arc::clone(&rungvt);
            let abort = Arc::clone(&abort);
            let barrier = Arc::clone(&barrier);
            let loop_cap = self.config.loop_cap;
            let zombie_threshold = self.config.zombie_threshold;
            handles.push(thread::spawn(move || {
                optimistic_worker(
                    worker,
                    lives,
                    rungvt,
                    abort,
                    barrier,
                    loop_cap,
                    zombie_threshold,
                )
            }));
        }

        let gvt_shares = shares.clone();
        let gvt_flag = Arc::clone(&rungvt);
        let gvt_interval = self.config.gvt_interval;
        let gvt_cap = self.config.gvt_cap;
        let gvt_policy = self.config.gvt_failure;
        let gvt_handle = thread::spawn(move || {
            gvt_loop(gvt_shares, gvt_flag, gvt_interval, gvt_cap, gvt_policy)
        });

        let mut cores_back = Vec::new();
        let mut first_error: Option<SimError> = None;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(core)) => cores_back.push(core),
                Ok(Err(e)) => {
                    error!("controller: worker for core {id} failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!("controller: worker thread for core {id} panicked");
                    first_error.get_or_insert(SimError::ThreadPanic(id));
                }
            }
        }
        rungvt.store(false, Ordering::Release);
        let gvt_result = match gvt_handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("controller: GVT thread panicked");
                Err(SimError::ThreadPanic(usize::MAX))
            }
        };
        self.tracers.flush_until(Timestamp::infinity());

        if let Some(e) = first_error {
            return Err(e);
        }
        let last_gvt = gvt_result?;
        let reverts = cores_back.iter().map(|c| c.reverts()).sum();
        let applied = cores_back
            .iter()
            .map(|c| c.gvt())
            .max()
            .unwrap_or(Timestamp::zero());
        let gvt = if applied.is_zero() {
            last_gvt.filter(|g| !g.is_zero())
        } else {
            Some(applied)
        };
        let bases: Vec<&Core<P>> = cores_back.iter().map(|c| &c.base).collect();
        Ok(Self::summary_from(&bases, gvt, reverts))
    }

    // ---------------------------- conservative ----------------------------

    fn run_conservative(&mut self) -> Result<SimSummary, SimError> {
        let built = self.build_cores(false)?;
        let core_count = self.config.cores;
        let net: Arc<Network<P>> = Arc::new(Network::new(core_count));
        let eot = Arc::new(SharedTimeVector::new(core_count, 0));
        let null_t = Arc::new(SharedTimeVector::new(core_count, 0));
        let barrier = Arc::new((Mutex::new(core_count as i64), Condvar::new()));

        let abort = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(core_count);
        for (core, influencers) in built.cores.into_iter().zip(built.influencers) {
            let worker = ConservativeCore::new(
                core,
                Arc::clone(&net),
                Arc::clone(&eot),
                Arc::clone(&null_t),
                influencers,
            );
            let abort = Arc::clone(&abort);
            let barrier = Arc::clone(&barrier);
            let loop_cap = self.config.loop_cap;
            handles.push(thread::spawn(move || {
                conservative_worker(worker, abort, barrier, loop_cap)
            }));
        }

        let mut cores_back = Vec::new();
        let mut first_error: Option<SimError> = None;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(core)) => cores_back.push(core),
                Ok(Err(e)) => {
                    error!("controller: worker for core {id} failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!("controller: worker thread for core {id} panicked");
                    first_error.get_or_insert(SimError::ThreadPanic(id));
                }
            }
        }
        self.tracers.flush_until(Timestamp::infinity());
        if let Some(e) = first_error {
            return Err(e);
        }
        let bases: Vec<&Core<P>> = cores_back.iter().map(|c| &c.base).collect();
        Ok(Self::summary_from(&bases, None, 0))
    }
}

fn barrier_wait(barrier: &(Mutex<i64>, Condvar)) {
    let (lock, cvar) = barrier;
    let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
    *count -= 1;
    if *count <= 0 {
        cvar.notify_all();
    } else {
        while *count > 0 {
            count = cvar.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// The optimistic worker loop: keep stepping until every core is idle and
/// the network is quiet, then meet the others at the exit barrier. An idle
/// core keeps draining its queue; a late message revives it.
fn optimistic_worker<P: Clone>(
    mut core: OptimisticCore<P>,
    lives: Arc<Vec<Arc<AtomicBool>>>,
    rungvt: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    barrier: Arc<(Mutex<i64>, Condvar)>,
    loop_cap: u64,
    zombie_threshold: u32,
) -> Result<OptimisticCore<P>, SimError> {
    let id = core.base.id();
    let run = |core: &mut OptimisticCore<P>| -> Result<(), SimError> {
        let mut turns: u64 = 0;
        loop {
            if abort.load(Ordering::Acquire) {
                debug!("worker {id}: a peer failed, cancelling");
                core.base.set_live(false);
                break;
            }
            if turns >= loop_cap {
                warn!("worker {id}: loop cap reached, forcing idle");
                core.base.set_live(false);
                break;
            }
            turns += 1;
            if core.base.zombie_rounds() > zombie_threshold {
                debug!("worker {id}: zombie threshold hit, going idle");
                core.base.set_live(false);
            }
            if !core.base.is_live() {
                let all_idle = lives.iter().all(|l| !l.load(Ordering::Acquire));
                if all_idle {
                    if core.network().empty() {
                        debug!("worker {id}: all idle and network quiet, leaving");
                        rungvt.store(false, Ordering::Release);
                        break;
                    }
                    if !rungvt.load(Ordering::Acquire) {
                        debug!("worker {id}: a peer already left, leaving too");
                        break;
                    }
                }
                thread::yield_now();
            }
            core.small_step()?;
        }
        Ok(())
    };
    let result = run(&mut core);
    core.base.set_live(false);
    rungvt.store(false, Ordering::Release);
    if result.is_err() {
        abort.store(true, Ordering::Release);
    }
    barrier_wait(&barrier);
    result.map(|()| core)
}

/// The conservative worker loop: step until idle, yielding briefly whenever
/// the core is pinned at its EIT.
fn conservative_worker<P: Clone>(
    mut core: ConservativeCore<P>,
    abort: Arc<AtomicBool>,
    barrier: Arc<(Mutex<i64>, Condvar)>,
    loop_cap: u64,
) -> Result<ConservativeCore<P>, SimError> {
    let id = core.base.id();
    let run = |core: &mut ConservativeCore<P>| -> Result<(), SimError> {
        let mut turns: u64 = 0;
        while core.base.is_live() {
            if abort.load(Ordering::Acquire) {
                debug!("worker {id}: a peer failed, cancelling");
                break;
            }
            if turns >= loop_cap {
                warn!("worker {id}: loop cap reached, forcing idle");
                break;
            }
            turns += 1;
            let progress = core.small_step()?;
            if !progress {
                thread::sleep(Duration::from_micros(50));
            }
        }
        Ok(())
    };
    let result = run(&mut core);
    if result.is_err() {
        abort.store(true, Ordering::Release);
        core.abandon();
    }
    barrier_wait(&barrier);
    result.map(|()| core)
}

/// The GVT thread: sleep, run a Mattern attempt, publish on success. Bounded
/// by the invocation cap; failures follow the configured policy.
fn gvt_loop(
    shares: Vec<Arc<GvtShared>>,
    rungvt: Arc<AtomicBool>,
    interval: Duration,
    cap: u64,
    policy: GvtFailure,
) -> Result<Option<Timestamp>, SimError> {
    let mut last: Option<Timestamp> = None;
    let mut rounds: u64 = 0;
    while rungvt.load(Ordering::Acquire) {
        thread::sleep(interval);
        if !rungvt.load(Ordering::Acquire) {
            break;
        }
        rounds += 1;
        if rounds > cap {
            return Err(SimError::GvtProtocol(format!(
                "GVT invocation cap of {cap} exceeded"
            )));
        }
        match run_round(&shares, &rungvt) {
            RoundOutcome::Found(gvt) if !gvt.is_infinite() => {
                if let Some(prev) = last {
                    if gvt < prev {
                        match policy {
                            GvtFailure::Abort => {
                                return Err(SimError::GvtProtocol(format!(
                                    "GVT regression from {prev} to {gvt}"
                                )))
                            }
                            GvtFailure::ContinueWithoutGvt => {
                                error!("gvt: regression from {prev} to {gvt}, halting GVT");
                                break;
                            }
                        }
                    }
                }
                publish(&shares, gvt);
                last = Some(gvt);
            }
            RoundOutcome::Found(_) => {
                // an infinite estimate means everyone has drained; nothing
                // left to reclaim
            }
            RoundOutcome::Interrupted => break,
            RoundOutcome::Failed => match policy {
                GvtFailure::Abort => {
                    return Err(SimError::GvtProtocol(
                        "second Mattern round left non-zero counts".into(),
                    ))
                }
                GvtFailure::ContinueWithoutGvt => {
                    error!("gvt: second round failed, halting GVT for this run");
                    break;
                }
            },
        }
    }
    Ok(last)
}
