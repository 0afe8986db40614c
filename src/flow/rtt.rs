use crate::clock::Mics;

/// Smoothed round trip time and its variance, with the usual exponential weights of 1/8 for the
///  mean and 1/4 for the variance
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Mics,
    smoothed: Mics,
    var: Mics,
    min: Mics,
}

impl RttEstimator {
    pub fn new(initial_rtt: Mics) -> RttEstimator {
        RttEstimator {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    pub fn smoothed(&self) -> Mics {
        self.smoothed
    }

    pub fn latest(&self) -> Mics {
        self.latest
    }

    pub fn var(&self) -> Mics {
        self.var
    }

    pub fn min(&self) -> Mics {
        self.min
    }

    pub fn update(&mut self, rtt: Mics) {
        self.latest = rtt;
        self.min = self.min.min(rtt);

        let var_sample = self.smoothed.abs_diff(rtt);
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + rtt) / 8;
    }

    /// smoothed RTT + `variance_factor` * variance, clamped to the given bounds
    pub fn rto(&self, variance_factor: u32, min_rto: Mics, max_rto: Mics) -> Mics {
        self.smoothed
            .saturating_add(self.var.saturating_mul(variance_factor.into()))
            .clamp(min_rto, max_rto)
    }
}

/// Longest backoff shift for repeated retransmissions, the resulting delay is capped by the
///  maximum RTO anyway
const MAX_BACKOFF_SHIFT: u32 = 16;

/// The current RTO with its configured bounds, for timing retransmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub rto: Mics,
    pub min_rto: Mics,
    pub max_rto: Mics,
}

impl Backoff {
    /// Timeout after the `attempt`th send (starting at 1), doubling with every attempt and
    ///  clamped to `[min_rto, max_rto]`
    pub fn timeout(&self, attempt: u32) -> Mics {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.rto
            .saturating_mul(1 << shift)
            .min(self.max_rto)
            .max(self.min_rto)
    }
}
