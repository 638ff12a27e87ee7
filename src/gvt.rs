//! Mattern's two-round GVT algorithm over the ring of optimistic cores.
//!
//! The token circulates Tmin (the minimum local clock), Tred (the minimum
//! timestamp of any red message) and the accumulated count vector. A round
//! succeeds when the counts cancel to zero after the ring walk; otherwise a
//! second round is run, and a second failure is reported to the caller's
//! configured policy.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::core::optimistic::GvtShared;
use crate::time::Timestamp;

/// The control token passed around the ring.
pub(crate) struct ControlToken {
    pub tmin: Timestamp,
    pub tred: Timestamp,
    pub counts: Vec<i64>,
}

impl ControlToken {
    fn new(cores: usize) -> Self {
        Self {
            tmin: Timestamp::infinity(),
            tred: Timestamp::infinity(),
            counts: vec![0; cores],
        }
    }

    fn count_is_zero(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }

    fn gvt_estimate(&self) -> Timestamp {
        Timestamp::from_time(self.tmin.time.min(self.tred.time))
    }
}

/// Outcome of one GVT attempt.
pub(crate) enum RoundOutcome {
    /// A consistent cut was found.
    Found(Timestamp),
    /// The run-GVT flag dropped mid-round; nothing was agreed.
    Interrupted,
    /// Both rounds left non-zero in-transit counts.
    Failed,
}

/// Fold one core's contribution into the token: wait until its inbound white
/// messages have settled, take the minima, absorb and clear its count row.
fn worker_pass(share: &GvtShared, token: &mut ControlToken, rungvt: &AtomicBool) -> bool {
    share.paint_red();
    if !share.wait_until_ok(token.counts[share.id()], rungvt) {
        return false;
    }
    token.tmin = token.tmin.min(Timestamp::from_time(share.tmin()));
    token.tred = token.tred.min(share.tred());
    share.fold_counts(&mut token.counts);
    true
}

/// Run one full Mattern attempt over the ring. Core 0 initiates and
/// finalizes; the others contribute in ring order.
pub(crate) fn run_round(shares: &[Arc<GvtShared>], rungvt: &AtomicBool) -> RoundOutcome {
    let first = &shares[0];

    // round one: paint the initiator red and seed the token
    first.paint_red();
    let mut token = ControlToken::new(shares.len());
    token.tmin = Timestamp::from_time(first.tmin());
    first.fold_counts(&mut token.counts);

    for share in &shares[1..] {
        if !worker_pass(share, &mut token, rungvt) {
            return RoundOutcome::Interrupted;
        }
    }
    if !first.wait_until_ok(token.counts[first.id()], rungvt) {
        return RoundOutcome::Interrupted;
    }
    if token.count_is_zero() {
        let gvt = token.gvt_estimate();
        debug!("gvt: clean first round, estimate {}", gvt);
        return RoundOutcome::Found(gvt);
    }

    // second round: counts were still in flight; walk the ring once more
    debug!("gvt: first round left transients, starting second round");
    token.tmin = Timestamp::from_time(first.tmin());
    token.tred = token.tred.min(first.tred());
    first.fold_counts(&mut token.counts);
    for share in &shares[1..] {
        if !worker_pass(share, &mut token, rungvt) {
            return RoundOutcome::Interrupted;
        }
    }
    if !first.wait_until_ok(token.counts[first.id()], rungvt) {
        return RoundOutcome::Interrupted;
    }
    if token.count_is_zero() {
        let gvt = token.gvt_estimate();
        debug!("gvt: second round converged, estimate {}", gvt);
        return RoundOutcome::Found(gvt);
    }
    warn!(
        "gvt: second round still counts {:?}, tmin {}, tred {}",
        token.counts, token.tmin, token.tred
    );
    RoundOutcome::Failed
}

/// Publish a freshly agreed GVT to every core's inbox.
pub(crate) fn publish(shares: &[Arc<GvtShared>], gvt: Timestamp) {
    info!("gvt: publishing {}", gvt);
    for share in shares {
        share.publish_gvt(gvt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn ring(n: usize) -> Vec<Arc<GvtShared>> {
        (0..n).map(|i| Arc::new(GvtShared::new(i, n))).collect()
    }

    #[test]
    fn quiet_ring_agrees_on_min_clock() {
        let shares = ring(3);
        shares[0].set_tmin(Timestamp::from_time(120));
        shares[1].set_tmin(Timestamp::from_time(80));
        shares[2].set_tmin(Timestamp::from_time(200));
        let rungvt = AtomicBool::new(true);
        match run_round(&shares, &rungvt) {
            RoundOutcome::Found(gvt) => assert_eq!(gvt, Timestamp::from_time(80)),
            _ => panic!("expected a clean round"),
        }
    }

    #[test]
    fn red_sends_bound_the_estimate() {
        let shares = ring(2);
        shares[0].set_tmin(Timestamp::from_time(500));
        shares[1].set_tmin(Timestamp::from_time(400));
        // a red message at 90 must cap the estimate
        shares[1].paint_red();
        let mut probe = crate::message::Message {
            src: crate::message::ModelUuid::new(1, 0),
            src_port: crate::message::PortId(0),
            dst: crate::message::ModelUuid::new(0, 0),
            dst_port: crate::message::PortId(0),
            timestamp: Timestamp::from_time(90),
            color: crate::message::Color::White,
            flags: crate::message::MsgFlags::default(),
            payload: 0u32,
        };
        shares[1].paint_outgoing(&mut probe);
        assert_eq!(probe.color, crate::message::Color::Red);

        let rungvt = AtomicBool::new(true);
        match run_round(&shares, &rungvt) {
            RoundOutcome::Found(gvt) => assert_eq!(gvt, Timestamp::from_time(90)),
            _ => panic!("expected a clean round"),
        }
    }

    #[test]
    fn transient_white_message_delays_the_round() {
        let shares = ring(2);
        shares[0].set_tmin(Timestamp::from_time(10));
        shares[1].set_tmin(Timestamp::from_time(10));
        // core 0 sent a white message to core 1 that was never received
        let mut probe = crate::message::Message {
            src: crate::message::ModelUuid::new(0, 0),
            src_port: crate::message::PortId(0),
            dst: crate::message::ModelUuid::new(1, 0),
            dst_port: crate::message::PortId(0),
            timestamp: Timestamp::from_time(15),
            color: crate::message::Color::White,
            flags: crate::message::MsgFlags::default(),
            payload: 0u32,
        };
        shares[0].paint_outgoing(&mut probe);

        let rungvt = Arc::new(AtomicBool::new(true));
        // the receiving core settles its debt from another thread, the way a
        // worker would while the token waits
        let receiver = Arc::clone(&shares[1]);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            receiver.count_white_receive();
        });
        match run_round(&shares, &rungvt) {
            RoundOutcome::Found(gvt) => assert_eq!(gvt, Timestamp::from_time(10)),
            _ => panic!("round should settle once the receive lands"),
        }
        handle.join().unwrap();
        assert!(rungvt.load(Ordering::Acquire));
    }

    #[test]
    fn dropped_flag_interrupts_the_walk() {
        let shares = ring(2);
        // leave a permanent imbalance so the round can never settle
        let mut probe = crate::message::Message {
            src: crate::message::ModelUuid::new(0, 0),
            src_port: crate::message::PortId(0),
            dst: crate::message::ModelUuid::new(1, 0),
            dst_port: crate::message::PortId(0),
            timestamp: Timestamp::from_time(5),
            color: crate::message::Color::White,
            flags: crate::message::MsgFlags::default(),
            payload: 0u32,
        };
        shares[0].paint_outgoing(&mut probe);
        let rungvt = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&rungvt);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            flag.store(false, Ordering::Release);
        });
        match run_round(&shares, &rungvt) {
            RoundOutcome::Interrupted => {}
            _ => panic!("expected interruption"),
        }
        handle.join().unwrap();
    }
}
