//! Congestion window in genes, following HighSpeed TCP (RFC 3649): AIMD whose additive
//!  increase grows and whose multiplicative decrease shrinks as the window gets bigger.

use tracing::{debug, trace};
use crate::safe_converter::PrecheckedCast;

/// RFC 3649 appendix B. Each entry is the upper cwnd bound of a bin and the bin's decrease
///  factor `b(w)` in fixed point (<< 8). A bin's additive increase is its index plus 1.
const HS_BINS: [(u32, u32); 73] = [
    (38, 128), (118, 112), (221, 104), (347, 98), (495, 93), (663, 89), (851, 86), (1058, 83),
    (1284, 81), (1529, 78), (1793, 76), (2076, 74), (2378, 72), (2699, 71), (3039, 69),
    (3399, 68), (3778, 66), (4177, 65), (4596, 64), (5036, 62), (5497, 61), (5979, 60),
    (6483, 59), (7009, 58), (7558, 57), (8130, 56), (8726, 55), (9346, 54), (9991, 53),
    (10661, 52), (11358, 52), (12082, 51), (12834, 50), (13614, 49), (14424, 48), (15265, 48),
    (16137, 47), (17042, 46), (17981, 45), (18955, 45), (19965, 44), (21013, 43), (22101, 43),
    (23230, 42), (24402, 41), (25618, 41), (26881, 40), (28193, 39), (29557, 39), (30975, 38),
    (32450, 38), (33986, 37), (35586, 36), (37253, 36), (38992, 35), (40808, 35), (42707, 34),
    (44694, 33), (46776, 33), (48961, 32), (51258, 32), (53677, 31), (56230, 30), (58932, 30),
    (61799, 29), (64851, 28), (68113, 28), (71617, 27), (75401, 26), (79517, 26), (84035, 25),
    (89053, 24), (u32::MAX, 23),
];

const MIN_CWND: u32 = 2;

#[derive(Debug)]
pub struct CongestionWindow {
    bin: usize,
    max_cwnd: u32,
    cwnd: u32,
    /// accumulated additive increase, converted to whole genes once it reaches cwnd
    increase_credit: u32,
}

impl CongestionWindow {
    pub fn new(initial_cwnd: u32, max_cwnd: u32) -> CongestionWindow {
        let cwnd = initial_cwnd.clamp(MIN_CWND, max_cwnd.max(MIN_CWND));
        CongestionWindow {
            bin: Self::bin_for(cwnd),
            max_cwnd,
            cwnd,
            increase_credit: 0,
        }
    }

    fn bin_for(cwnd: u32) -> usize {
        HS_BINS.iter()
            .position(|(upper, _)| cwnd <= *upper)
            .unwrap_or(HS_BINS.len() - 1)
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd <= HS_BINS[0].0
    }

    /// Called for every acknowledged gene. The window grows only while it is actually used,
    ///  there is no evidence of additional bandwidth otherwise.
    pub fn on_ack(&mut self, genes_in_flight: u32) {
        if self.cwnd >= self.max_cwnd {
            return;
        }

        if self.is_slow_start() {
            if genes_in_flight.saturating_mul(2) < self.cwnd {
                trace!("slow start with less than half the window in flight - no adjustment");
                return;
            }
            self.cwnd += 1;
        }
        else {
            if genes_in_flight < self.cwnd {
                trace!("congestion avoidance with window not fully used - no adjustment");
                return;
            }

            self.increase_credit += PrecheckedCast::<u32>::prechecked_cast(self.bin + 1);
            while self.increase_credit >= self.cwnd {
                self.increase_credit -= self.cwnd;
                self.cwnd += 1;
            }
        }

        while self.cwnd > HS_BINS[self.bin].0 {
            self.bin += 1;
        }
        self.cwnd = self.cwnd.min(self.max_cwnd);
        trace!("congestion window grew to {} genes", self.cwnd);
    }

    /// multiplicative decrease
    pub fn on_loss(&mut self) {
        let decrease = (u64::from(self.cwnd) * u64::from(HS_BINS[self.bin].1)) >> 8;
        let decrease = u32::try_from(decrease).unwrap_or(u32::MAX);

        self.cwnd = self.cwnd.saturating_sub(decrease).max(MIN_CWND);
        self.increase_credit = 0;

        while self.bin > 0 && self.cwnd <= HS_BINS[self.bin - 1].0 {
            self.bin -= 1;
        }
        debug!("loss -> congestion window shrunk to {} genes", self.cwnd);
    }
}
