use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use virta::prelude::*;

pub struct Relay {
    delay: u64,
    held: Option<u32>,
}

impl Relay {
    pub fn new(delay: u64) -> Self {
        Relay { delay, held: None }
    }
}

impl AtomicModel<u32> for Relay {
    fn time_advance(&self) -> Timestamp {
        match self.held {
            Some(_) => Timestamp::from_time(self.delay),
            None => Timestamp::infinity(),
        }
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        if let Some(held) = self.held {
            bag.emit(PortId(0), held);
        }
    }

    fn internal_transition(&mut self) {
        self.held = None;
    }

    fn external_transition(&mut self, _elapsed: Timestamp, inputs: &[PortEvent<u32>]) {
        if let Some(input) = inputs.last() {
            self.held = Some(input.payload);
        }
    }
}

pub struct Pulse {
    period: u64,
    count: u32,
}

impl AtomicModel<u32> for Pulse {
    fn time_advance(&self) -> Timestamp {
        Timestamp::from_time(self.period)
    }

    fn output(&self, bag: &mut OutputBag<u32>) {
        bag.emit(PortId(0), self.count);
    }

    fn internal_transition(&mut self) {
        self.count = self.count.wrapping_add(1);
    }

    fn external_transition(&mut self, _elapsed: Timestamp, _inputs: &[PortEvent<u32>]) {}
}

fn run_chain(length: usize, terminal: u64) {
    let mut top = CoupledModel::new("chain");
    top.add_atomic(
        ModelSpec::new("pulse", Box::new(Pulse { period: 10, count: 0 })).with_output("out"),
    );
    for i in 0..length {
        top.add_atomic(
            ModelSpec::new(format!("relay{i}"), Box::new(Relay::new(3)))
                .with_input("in")
                .with_output("out"),
        );
    }
    top.connect("pulse", "out", "relay0", "in", None);
    for i in 1..length {
        top.connect(format!("relay{}", i - 1), "out", format!("relay{i}"), "in", None);
    }

    let config = SimConfig::new(SimType::Sequential)
        .with_termination_time(Timestamp::from_time(terminal));
    let mut controller =
        Controller::new(config, RootModel::new(top), TracerSet::new()).unwrap();
    controller.simulate().unwrap();
}

fn sim_bench(c: &mut Criterion) {
    c.bench_function("relay_chain_sequential", |b| {
        b.iter(|| run_chain(black_box(16), black_box(100_000)));
    });
}

criterion_group!(benches, sim_bench);

criterion_main!(benches);
