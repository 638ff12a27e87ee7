//! The Time Warp core: speculative execution with a sent-message log,
//! antimessage annihilation, state rollback and Mattern color accounting.
//!
//! The GVT thread and the worker thread share only the `GvtShared` cell
//! (color, Tred, Tmin, the count row, and the GVT inbox); everything else is
//! owned by the worker. New GVT values are applied by the worker at the top
//! of its next small step.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace};

use crate::message::{Color, Message, MsgFlags, MsgId};
use crate::network::Network;
use crate::time::Timestamp;
use crate::scheduler::MessagePool;
use crate::SimError;

use super::Core;

/// Per-core state shared with the GVT thread. Lock order is color before
/// counts; no code path holds more than those two.
pub(crate) struct GvtShared {
    id: usize,
    color: Mutex<Color>,
    tred: Mutex<Timestamp>,
    tmin: AtomicU64,
    counts: Mutex<Vec<i64>>,
    inbox: Mutex<Option<Timestamp>>,
}

impl GvtShared {
    pub(crate) fn new(id: usize, cores: usize) -> Self {
        Self {
            id,
            color: Mutex::new(Color::White),
            tred: Mutex::new(Timestamp::infinity()),
            tmin: AtomicU64::new(0),
            counts: Mutex::new(vec![0; cores]),
            inbox: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Paint an outgoing message with this core's color and account for it:
    /// white sends bump the count row, red sends lower Tred.
    pub(crate) fn paint_outgoing<P>(&self, msg: &mut Message<P>) {
        let color = self.color.lock().unwrap_or_else(|e| e.into_inner());
        msg.color = *color;
        match *color {
            Color::White => {
                let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
                counts[msg.dst.core] += 1;
            }
            Color::Red => {
                let mut tred = self.tred.lock().unwrap_or_else(|e| e.into_inner());
                if msg.timestamp < *tred {
                    *tred = msg.timestamp;
                }
            }
        }
    }

    /// Mattern receive accounting: a white message arriving at this core.
    pub(crate) fn count_white_receive(&self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts[self.id] -= 1;
    }

    /// Turn red for a new round. Resets Tred first, as the receive-control
    /// algorithm requires.
    pub(crate) fn paint_red(&self) {
        let mut color = self.color.lock().unwrap_or_else(|e| e.into_inner());
        if *color == Color::White {
            let mut tred = self.tred.lock().unwrap_or_else(|e| e.into_inner());
            *tred = Timestamp::infinity();
            *color = Color::Red;
        }
    }

    pub(crate) fn paint_white(&self) {
        let mut color = self.color.lock().unwrap_or_else(|e| e.into_inner());
        *color = Color::White;
    }

    pub(crate) fn tred(&self) -> Timestamp {
        *self.tred.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn tmin(&self) -> u64 {
        self.tmin.load(Ordering::Acquire)
    }

    pub(crate) fn set_tmin(&self, t: Timestamp) {
        self.tmin.store(t.time, Ordering::Release);
    }

    pub(crate) fn lower_tmin(&self, t: Timestamp) {
        self.tmin.fetch_min(t.time, Ordering::AcqRel);
    }

    /// Fold this core's count row into the token and zero the row.
    pub(crate) fn fold_counts(&self, token: &mut [i64]) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        for (t, v) in token.iter_mut().zip(counts.iter_mut()) {
            *t += *v;
            *v = 0;
        }
    }

    pub(crate) fn own_count(&self) -> i64 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts[self.id]
    }

    /// Block until every white message addressed to this core has been
    /// received, or the run-GVT flag drops.
    pub(crate) fn wait_until_ok(&self, expected: i64, rungvt: &AtomicBool) -> bool {
        loop {
            if !rungvt.load(Ordering::Acquire) {
                return false;
            }
            if self.own_count() + expected <= 0 {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Deposit a freshly agreed GVT for the owning worker to apply.
    pub(crate) fn publish_gvt(&self, gvt: Timestamp) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        *inbox = Some(gvt);
    }

    pub(crate) fn take_gvt(&self) -> Option<Timestamp> {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn counted_insert(map: &mut HashMap<MsgId, u32>, id: MsgId) {
    *map.entry(id).or_insert(0) += 1;
}

fn counted_remove(map: &mut HashMap<MsgId, u32>, id: &MsgId) -> bool {
    match map.get_mut(id) {
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                map.remove(id);
            }
            true
        }
        None => false,
    }
}

/// A Time Warp core: the base engine plus speculation bookkeeping.
pub struct OptimisticCore<P> {
    pub(crate) base: Core<P>,
    net: Arc<Network<P>>,
    pub(crate) sync: Arc<GvtShared>,
    /// Messages this core sent since the last GVT, in send order.
    sent: VecDeque<Message<P>>,
    /// Inbound messages not yet delivered to a transition.
    pending: MessagePool<P>,
    /// Delivered messages, kept until GVT so a revert can requeue them.
    processed: VecDeque<Message<P>>,
    processed_ids: HashMap<MsgId, u32>,
    /// Antimessages that annihilated processed originals (KILL marks).
    killed: HashMap<MsgId, u32>,
    /// Antimessages that arrived before their originals (DELETE marks).
    dead: HashMap<MsgId, u32>,
    gvt: Timestamp,
    reverts: u64,
}

impl<P: Clone> OptimisticCore<P> {
    pub(crate) fn new(base: Core<P>, net: Arc<Network<P>>, sync: Arc<GvtShared>) -> Self {
        debug_assert_eq!(base.id, sync.id());
        Self {
            base,
            net,
            sync,
            sent: VecDeque::new(),
            pending: MessagePool::new(),
            processed: VecDeque::new(),
            processed_ids: HashMap::new(),
            killed: HashMap::new(),
            dead: HashMap::new(),
            gvt: Timestamp::zero(),
            reverts: 0,
        }
    }

    pub(crate) fn network(&self) -> &Arc<Network<P>> {
        &self.net
    }

    pub fn gvt(&self) -> Timestamp {
        self.gvt
    }

    pub(crate) fn reverts(&self) -> u64 {
        self.reverts
    }

    /// One optimistic small step: apply any new GVT, pull and sort inbound
    /// mail (rolling back when the past arrives), then run the base
    /// output-route-transition cycle against the pending pool.
    pub fn small_step(&mut self) -> Result<(), SimError> {
        if let Some(gvt) = self.sync.take_gvt() {
            self.apply_gvt(gvt)?;
        }

        let batch = self.net.drain(self.base.id);
        if !batch.is_empty() && !self.base.is_live() {
            debug!(
                "core {}: woken from idle by {} arrivals",
                self.base.id,
                batch.len()
            );
            self.base.set_live(true);
        }
        self.sort_incoming(batch)?;

        if !self.base.is_live() {
            return Ok(());
        }

        self.base.find_imminent();
        let mut routed = Vec::new();
        self.base.collect_output(&mut routed)?;
        for msg in routed {
            if msg.dst.core == self.base.id {
                let mut msg = msg;
                msg.flags.set(MsgFlags::HEAPED);
                self.pending.push(msg);
            } else {
                self.send_remote(msg);
            }
        }

        while let Some(mut msg) = self.pending.pop_due(self.base.time) {
            msg.flags.clear(MsgFlags::HEAPED);
            msg.flags.set(MsgFlags::PROCESSED);
            self.base.deliver_local(msg);
        }

        if self.base.imminent.is_empty() && self.base.mailbag.is_empty() {
            self.base.zombie_rounds += 1;
        } else {
            self.base.zombie_rounds = 0;
        }

        let delivered = self.base.transition()?;
        for msg in delivered {
            // local-to-local messages die here: a revert re-executes the
            // producing output, so requeueing them would duplicate them
            if msg.src.core == self.base.id {
                continue;
            }
            counted_insert(&mut self.processed_ids, msg.id());
            self.processed.push_back(msg);
        }
        self.base.imminent.clear();
        self.base.check_termination_functor();

        if !self.base.sync_time(self.pending.next_time()) {
            self.base.set_live(false);
        }
        self.sync.set_tmin(self.base.time);
        Ok(())
    }

    /// Paint, count and log an outgoing message, then hand it to the network.
    fn send_remote(&mut self, mut msg: Message<P>) {
        self.sync.paint_outgoing(&mut msg);
        self.sent.push_back(msg.clone());
        self.net.accept(msg);
    }

    /// Sort a drained batch: antimessages annihilate, originals queue, and a
    /// message from the past triggers one revert to the batch minimum.
    fn sort_incoming(&mut self, batch: Vec<Message<P>>) -> Result<(), SimError> {
        let mut revert_to: Option<Timestamp> = None;
        let note_revert = |sync: &GvtShared, t: Timestamp, current: &mut Option<Timestamp>| {
            let to = Timestamp::from_time(t.time);
            // publish the lower bound at once so a concurrent GVT round can
            // never observe a Tmin past the pending rollback
            sync.lower_tmin(to);
            *current = Some(match *current {
                Some(prev) => prev.min(to),
                None => to,
            });
        };
        for mut msg in batch {
            if msg.is_anti() {
                if self.handle_antimessage(&msg) {
                    note_revert(&self.sync, msg.timestamp, &mut revert_to);
                }
                continue;
            }
            if msg.timestamp.time < self.base.time.time {
                note_revert(&self.sync, msg.timestamp, &mut revert_to);
            }
            if counted_remove(&mut self.dead, &msg.id()) {
                // the antimessage got here first; annihilate on arrival
                trace!(
                    "core {}: arriving original annihilated by waiting antimessage {:?}",
                    self.base.id,
                    msg.id()
                );
                if msg.color == Color::White {
                    self.sync.count_white_receive();
                }
            } else {
                if msg.color == Color::White {
                    self.sync.count_white_receive();
                }
                msg.flags.set(MsgFlags::HEAPED);
                self.pending.push(msg);
            }
        }
        if let Some(to) = revert_to {
            self.revert(to)?;
        }
        Ok(())
    }

    /// Antimessage dispatch: the original is either already processed (KILL,
    /// undone by a revert), still pending (ERASE), or not seen yet (DELETE).
    /// Returns true when the annihilation invalidates executed work.
    fn handle_antimessage(&mut self, anti: &Message<P>) -> bool {
        let id = anti.id();
        if self.processed_ids.contains_key(&id) {
            trace!(
                "core {}: antimessage for processed original, marking KILL {:?}",
                self.base.id,
                id
            );
            counted_insert(&mut self.killed, id);
            anti.timestamp.time <= self.base.time.time
        } else if self.pending.contains(&id) {
            trace!(
                "core {}: antimessage for pending original, marking ERASE {:?}",
                self.base.id,
                id
            );
            self.pending.erase(id);
            false
        } else {
            trace!(
                "core {}: antimessage ahead of its original, marking DELETE {:?}",
                self.base.id,
                id
            );
            counted_insert(&mut self.dead, id);
            false
        }
    }

    /// Roll this core back so it can re-execute from `to`.
    ///
    /// Sent messages at or past `to` are antimessaged, processed messages are
    /// requeued (unless killed), model states are restored and the scheduler
    /// rebuilt. Tracer output past `to` is discarded.
    pub(crate) fn revert(&mut self, to: Timestamp) -> Result<(), SimError> {
        let to = Timestamp::from_time(to.time);
        if to < self.gvt {
            return Err(SimError::GvtProtocol(format!(
                "core {} asked to revert to {} below GVT {}",
                self.base.id, to, self.gvt
            )));
        }
        self.reverts += 1;
        info!(
            "core {}: reverting from {} to {}",
            self.base.id, self.base.time, to
        );
        if !self.base.is_live() {
            self.base.set_live(true);
            self.base.terminated_by_functor = false;
        }

        while let Some(tail) = self.sent.back() {
            if tail.timestamp.time >= to.time {
                let msg = self.sent.pop_back().expect("tail exists");
                trace!("core {}: antimessaging {:?}", self.base.id, msg.id());
                self.net.accept(msg.to_anti());
            } else {
                break;
            }
        }

        while let Some(tail) = self.processed.back() {
            if tail.timestamp.time >= to.time {
                let mut msg = self.processed.pop_back().expect("tail exists");
                let id = msg.id();
                counted_remove(&mut self.processed_ids, &id);
                if counted_remove(&mut self.killed, &id) {
                    trace!("core {}: dropping killed processed message {:?}", self.base.id, id);
                    continue;
                }
                msg.flags.clear(MsgFlags::PROCESSED);
                msg.flags.set(MsgFlags::HEAPED);
                self.pending.push(msg);
            } else {
                break;
            }
        }

        self.base.revert_models(to);
        self.sync.set_tmin(self.base.time);
        self.base.tracers.revert_until(to);
        Ok(())
    }

    /// Apply a newly agreed GVT: reclaim logs and history older than it,
    /// commit trace output, repaint white.
    fn apply_gvt(&mut self, gvt: Timestamp) -> Result<(), SimError> {
        if gvt < self.gvt {
            return Err(SimError::GvtProtocol(format!(
                "core {}: GVT regression from {} to {}",
                self.base.id, self.gvt, gvt
            )));
        }
        debug!("core {}: applying GVT {}", self.base.id, gvt);
        self.gvt = gvt;

        while let Some(front) = self.sent.front() {
            if front.timestamp.time < gvt.time {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.processed.front() {
            if front.timestamp.time < gvt.time {
                let msg = self.processed.pop_front().expect("front exists");
                counted_remove(&mut self.processed_ids, &msg.id());
            } else {
                break;
            }
        }
        self.killed.retain(|id, _| id.timestamp.time >= gvt.time);
        self.dead.retain(|id, _| id.timestamp.time >= gvt.time);
        self.base.prune_history(gvt);
        self.sync.paint_white();
        self.base.tracers.flush_until(gvt);
        Ok(())
    }

    /// Number of messages waiting in the pending pool, for tests and the
    /// GVT invariant checks.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn sent_len(&self) -> usize {
        self.sent.len()
    }
}
