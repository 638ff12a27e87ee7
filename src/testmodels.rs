//! Models shared by the unit and scenario tests: the traffic light and
//! policeman pair, an absolute-time emitter with a counting sink, DEVStone
//! processors and the randomized interconnect generator.

use bytemuck::{Pod, Zeroable};

use crate::message::PortId;
use crate::model::{AtomicModel, OutputBag, PortEvent, SavedState};
use crate::time::Timestamp;

pub const PHASE_RED: u32 = 0;
pub const PHASE_GREEN: u32 = 1;
pub const PHASE_YELLOW: u32 = 2;
pub const PHASE_MANUAL: u32 = 3;

/// Take-manual-control signal payload.
pub const SIG_MANUAL: u32 = 1;
/// Release-back-to-autonomous signal payload.
pub const SIG_AUTONOMOUS: u32 = 2;

#[derive(Copy, Clone)]
#[repr(C)]
struct LightState {
    phase: u32,
    _pad: u32,
}

unsafe impl Pod for LightState {}
unsafe impl Zeroable for LightState {}

/// Traffic light cycling red(60) -> green(50) -> yellow(10) -> red, with a
/// manual mode entered and left on policeman signals.
pub struct TrafficLight {
    state: LightState,
}

impl TrafficLight {
    pub fn new() -> Self {
        Self {
            state: LightState { phase: PHASE_RED, _pad: 0 },
        }
    }
}

impl AtomicModel<u32> for TrafficLight {
    fn time_advance(&self) -> Timestamp {
        match self.state.phase {
            PHASE_RED => Timestamp::from_time(60),
            PHASE_GREEN => Timestamp::from_time(50),
            PHASE_YELLOW => Timestamp::from_time(10),
            _ => Timestamp::infinity(),
        }
    }

    fn output(&self, _bag: &mut OutputBag<u32>) {}

    fn internal_transition(&mut self) {
        self.state.phase = match self.state.phase {
            PHASE_RED => PHASE_GREEN,
            PHASE_GREEN => PHASE_YELLOW,
            _ => PHASE_RED,
        };
    }

    fn external_transition(&mut self, _elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        for input in inputs {
            match input.payload {
                SIG_MANUAL => self.state.phase = PHASE_MANUAL,
                SIG_AUTONOMOUS => self.state.phase = PHASE_RED,
                _ => {}
            }
        }
    }

    fn lookahead(&self) -> Timestamp {
        // reacts within one tick of an input; the minimum legal promise
        Timestamp::from_time(1)
    }

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<LightState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        match self.state.phase {
            PHASE_RED => "red",
            PHASE_GREEN => "green",
            PHASE_YELLOW => "yellow",
            _ => "manual",
        }
        .to_string()
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
struct PolicemanState {
    phase: u32,
    _pad: u32,
}

unsafe impl Pod for PolicemanState {}
unsafe impl Zeroable for PolicemanState {}

/// Interrupts the light at t=200 (manual) and t=300 (back to autonomous),
/// then retires. Lookahead is infinite: all its output is internally
/// scheduled.
pub struct Policeman {
    state: PolicemanState,
}

impl Policeman {
    pub fn new() -> Self {
        Self {
            state: PolicemanState { phase: 0, _pad: 0 },
        }
    }
}

impl AtomicModel<u32> for Policeman {
    fn time_advance(&self) -> Timestamp {
        match self.state.phase {
            0 => Timestamp::from_time(200),
            1 => Timestamp::from_time(100),
            _ => Timestamp::infinity(),
        }
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        match self.state.phase {
            0 => bag.emit(PortId(0), SIG_MANUAL),
            1 => bag.emit(PortId(0), SIG_AUTONOMOUS),
            _ => {}
        }
    }

    fn internal_transition(&mut self) {
        self.state.phase += 1;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, _inputs: &[PortEvent<u32>]) {}

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<PolicemanState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        format!("phase{}", self.state.phase)
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
struct EmitterState {
    idx: u64,
    last: u64,
}

unsafe impl Pod for EmitterState {}
unsafe impl Zeroable for EmitterState {}

/// Emits its sequence number on port 0 at a fixed list of absolute times.
pub struct Emitter {
    times: Vec<u64>,
    state: EmitterState,
}

impl Emitter {
    pub fn new(times: Vec<u64>) -> Self {
        Self {
            times,
            state: EmitterState { idx: 0, last: 0 },
        }
    }
}

impl AtomicModel<u32> for Emitter {
    fn time_advance(&self) -> Timestamp {
        match self.times.get(self.state.idx as usize) {
            Some(&t) => Timestamp::from_time(t - self.state.last),
            None => Timestamp::infinity(),
        }
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        bag.emit(PortId(0), self.state.idx as u32);
    }

    fn internal_transition(&mut self) {
        self.state.last = self.times[self.state.idx as usize];
        self.state.idx += 1;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, _inputs: &[PortEvent<u32>]) {}

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<EmitterState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        self.state.idx.to_string()
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
struct SinkState {
    received: u64,
}

unsafe impl Pod for SinkState {}
unsafe impl Zeroable for SinkState {}

/// Passive receiver that counts everything delivered to it.
pub struct Sink {
    state: SinkState,
}

impl Sink {
    pub fn new() -> Self {
        Self {
            state: SinkState { received: 0 },
        }
    }
}

impl AtomicModel<u32> for Sink {
    fn time_advance(&self) -> Timestamp {
        Timestamp::infinity()
    }

    fn output(&self, _bag: &mut OutputBag<u32>) {}

    fn internal_transition(&mut self) {}

    fn external_transition(&mut self, _elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        self.state.received += inputs.len() as u64;
    }

    fn lookahead(&self) -> Timestamp {
        Timestamp::from_time(1)
    }

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<SinkState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        self.state.received.to_string()
    }
}

/// Fires every `period` time units, emitting a running counter.
pub struct Generator {
    period: u64,
    count: u32,
}

impl Generator {
    pub fn new(period: u64) -> Self {
        Self { period, count: 0 }
    }
}

impl AtomicModel<u32> for Generator {
    fn time_advance(&self) -> Timestamp {
        Timestamp::from_time(self.period)
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        bag.emit(PortId(0), self.count);
    }

    fn internal_transition(&mut self) {
        self.count += 1;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, _inputs: &[PortEvent<u32>]) {}

    fn describe(&self) -> String {
        self.count.to_string()
    }
}

/// DEVStone-style processor: holds an incoming event for a fixed delay, then
/// forwards it. A new arrival while busy replaces the held event.
pub struct Processor {
    delay: u64,
    held: Option<u32>,
    forwarded: u64,
}

impl Processor {
    pub fn new(delay: u64) -> Self {
        Self {
            delay,
            held: None,
            forwarded: 0,
        }
    }
}

impl AtomicModel<u32> for Processor {
    fn time_advance(&self) -> Timestamp {
        if self.held.is_some() {
            Timestamp::from_time(self.delay)
        } else {
            Timestamp::infinity()
        }
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        if let Some(held) = self.held {
            bag.emit(PortId(0), held);
        }
    }

    fn internal_transition(&mut self) {
        self.held = None;
        self.forwarded += 1;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        if let Some(input) = inputs.last() {
            self.held = Some(input.payload);
        }
    }

    fn describe(&self) -> String {
        format!("fwd:{}", self.forwarded)
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
struct EchoState {
    holding: u32,
    value: u32,
}

unsafe impl Pod for EchoState {}
unsafe impl Zeroable for EchoState {}

/// Ping-pong endpoint: on input `n` it schedules a reply carrying `n + 1`
/// after `delay`. One side starts the exchange.
pub struct Echo {
    delay: u64,
    state: EchoState,
}

impl Echo {
    pub fn new(delay: u64, starts: bool) -> Self {
        Self {
            delay,
            state: EchoState {
                holding: starts as u32,
                value: 0,
            },
        }
    }
}

impl AtomicModel<u32> for Echo {
    fn time_advance(&self) -> Timestamp {
        if self.state.holding == 1 {
            Timestamp::from_time(self.delay)
        } else {
            Timestamp::infinity()
        }
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        bag.emit(PortId(0), self.state.value);
    }

    fn internal_transition(&mut self) {
        self.state.holding = 0;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        if let Some(input) = inputs.last() {
            self.state.value = input.payload + 1;
            self.state.holding = 1;
        }
    }

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<EchoState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        self.state.value.to_string()
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
struct TickerState {
    count: u64,
}

unsafe impl Pod for TickerState {}
unsafe impl Zeroable for TickerState {}

/// Fires every tick and counts. Placed next to slower models it drags its
/// core ahead of the others, which is exactly what rollback tests want.
pub struct Ticker {
    state: TickerState,
}

impl Ticker {
    pub fn new() -> Self {
        Self {
            state: TickerState { count: 0 },
        }
    }
}

impl AtomicModel<u32> for Ticker {
    fn time_advance(&self) -> Timestamp {
        Timestamp::from_time(1)
    }

    fn output(&self, _bag: &mut OutputBag<u32>) {}

    fn internal_transition(&mut self) {
        self.state.count += 1;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, _inputs: &[PortEvent<u32>]) {}

    fn save_state(&self) -> SavedState {
        SavedState::from_pod(&self.state)
    }

    fn restore_state(&mut self, state: &SavedState) {
        if let Some(s) = state.read::<TickerState>() {
            self.state = s;
        }
    }

    fn describe(&self) -> String {
        self.state.count.to_string()
    }
}

/// High-interconnect node: every node broadcasts to every other node with a
/// randomized period, and counts what it hears. `sigma` is the time left to
/// the next firing, so receipts do not reset the schedule. Deterministic
/// under a fixed seed.
pub struct InterconnectNode {
    rng: rand::rngs::StdRng,
    sigma: u64,
    sent: u64,
    received: u64,
}

impl InterconnectNode {
    pub fn new(seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let sigma = rng.random_range(75..=125);
        Self {
            rng,
            sigma,
            sent: 0,
            received: 0,
        }
    }
}

impl AtomicModel<u32> for InterconnectNode {
    fn time_advance(&self) -> Timestamp {
        Timestamp::from_time(self.sigma)
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        bag.emit(PortId(0), self.sent as u32);
    }

    fn internal_transition(&mut self) {
        use rand::Rng;
        self.sent += 1;
        self.sigma = self.rng.random_range(75..=125);
    }

    fn external_transition(&mut self, elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        self.received += inputs.len() as u64;
        self.sigma = self.sigma.saturating_sub(elapsed.time);
    }

    fn describe(&self) -> String {
        format!("sent:{} recv:{}", self.sent, self.received)
    }
}
