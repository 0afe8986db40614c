use std::time::Duration;
use anyhow::bail;
use crate::frames::FirstGeneFrame;
use crate::relay::RELAY_HEADER_LEN;

#[derive(Clone, Debug)]
pub struct GeneConfig {
    /// This is the maximum size of a datagram (i.e. the UDP payload) the engine sends, including
    ///  the relay header and the frame header. Genes are never fragmented at IP level, so this
    ///  length must be supported by all network connections between nodes.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value
    ///  too big causes datagrams to be dropped, choosing it too small wastes bandwidth.
    pub max_frame_length: usize,

    /// This is the maximum number of *genes* (not bytes) a transmission keeps in its sliding
    ///  window, on the sender side pending an ack and on the receiver side pending reassembly
    pub gene_window_size: u32,

    /// RTT assumed before the first sample is measured
    pub initial_rtt: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// RTO = smoothed RTT + `rto_variance_factor` * RTT variance
    pub rto_variance_factor: u32,

    pub initial_congestion_window: u32,
    pub max_congestion_window: u32,

    /// A gene that was sent this many times without being acknowledged times out its transmission
    pub max_retransmissions: u32,
    /// Upper bound for a transmission's lifetime without progress
    pub transmission_timeout: Duration,

    pub max_block_length: usize,
    pub max_stream_length: u32,

    /// Interval of the timer loop: acks, lost gene reports, retransmissions and timeouts are
    ///  driven by this tick
    pub tick_interval: Duration,
    /// Completed transmissions are remembered this long to re-ack late duplicates. Connections
    ///  without transmissions are evicted after this much inactivity.
    pub completed_retention: Duration,
    /// A connection is closed after this many malformed or otherwise invalid frames
    pub max_protocol_violations: u32,

    /// This is the number of buffers per size class that will be pooled at a given time - buffers
    ///  in excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    pub relay: RelayConfig,
}

impl GeneConfig {
    /// ipv4 with end-to-end full Ethernet MTU - without optional headers
    pub fn default_ipv4() -> GeneConfig {
        GeneConfig {
            max_frame_length: 1472,
            gene_window_size: 256,
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(5),
            rto_variance_factor: 4,
            initial_congestion_window: 32,
            max_congestion_window: 4096,
            max_retransmissions: 8,
            transmission_timeout: Duration::from_secs(30),
            max_block_length: 16*1024*1024,
            max_stream_length: u32::MAX,
            tick_interval: Duration::from_millis(10),
            completed_retention: Duration::from_secs(5),
            max_protocol_violations: 16,
            buffer_pool_size: 1024,
            relay: RelayConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_length < Self::MIN_FRAME_LENGTH {
            bail!("max frame length {} is too small, must be at least {}", self.max_frame_length, Self::MIN_FRAME_LENGTH);
        }
        if self.max_frame_length > u16::MAX as usize {
            bail!("max frame length {} does not fit into a UDP datagram", self.max_frame_length);
        }
        if self.gene_window_size < 2 {
            bail!("gene window size must be at least 2");
        }
        if self.min_rto.is_zero() || self.min_rto > self.max_rto {
            bail!("RTO bounds are inconsistent: min {:?}, max {:?}", self.min_rto, self.max_rto);
        }
        if self.initial_congestion_window < 2 || self.initial_congestion_window > self.max_congestion_window {
            bail!("initial congestion window {} must be between 2 and the maximum of {}", self.initial_congestion_window, self.max_congestion_window);
        }
        if self.max_retransmissions == 0 {
            bail!("at least one retransmission must be allowed");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.max_block_length.div_ceil(self.gene_payload_len()) > u32::MAX as usize {
            bail!("max block length {} exceeds the number of addressable genes", self.max_block_length);
        }
        self.relay.validate()
    }

    const MIN_FRAME_LENGTH: usize = 100;

    /// Every gene carries this many payload bytes (except for the last gene of a block or a
    ///  stream write, which may be shorter). The first gene's header is the longer one, and the
    ///  payload length is derived from it so that all genes share the same size.
    pub fn gene_payload_len(&self) -> usize {
        self.max_frame_length - RELAY_HEADER_LEN - FirstGeneFrame::LEN
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// A relay mapping expires after this much inactivity
    pub retention: Duration,
    /// Maximum number of relay hops a client circuit may chain
    pub max_serial_relays: usize,
    /// Maximum number of relay mappings an agent maintains at the same time
    pub max_parallel_relays: usize,
    /// Maximum number of relay mappings per requesting connection
    pub max_relay_exchanges: usize,
    /// Points debited for each forwarded datagram
    pub forward_cost: u64,
    /// Points a new relay mapping starts with, before any explicit credit
    pub initial_points: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            retention: Duration::from_secs(5*60),
            max_serial_relays: 3,
            max_parallel_relays: 1000,
            max_relay_exchanges: 100,
            forward_cost: 1,
            initial_points: 0,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.forward_cost == 0 {
            bail!("relay forward cost must be positive");
        }
        if self.max_relay_exchanges > self.max_parallel_relays {
            bail!("per-connection relay limit {} exceeds the overall limit {}", self.max_relay_exchanges, self.max_parallel_relays);
        }
        // every relay occupies two ids, and random allocation needs headroom
        if self.max_parallel_relays > (u16::MAX / 4) as usize {
            bail!("at most {} parallel relays are supported", u16::MAX / 4);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        GeneConfig::default_ipv4().validate().unwrap();
    }

    #[test]
    fn test_gene_payload_len() {
        let mut config = GeneConfig::default_ipv4();
        config.max_frame_length = 1056;
        assert_eq!(config.gene_payload_len(), 1024);
    }

    #[rstest]
    #[case::frame_too_small(|c: &mut GeneConfig| c.max_frame_length = 99)]
    #[case::frame_too_big(|c: &mut GeneConfig| c.max_frame_length = 70_000)]
    #[case::window(|c: &mut GeneConfig| c.gene_window_size = 1)]
    #[case::rto_order(|c: &mut GeneConfig| c.min_rto = Duration::from_secs(10))]
    #[case::rto_zero(|c: &mut GeneConfig| c.min_rto = Duration::ZERO)]
    #[case::cwnd(|c: &mut GeneConfig| c.initial_congestion_window = 1)]
    #[case::cwnd_above_max(|c: &mut GeneConfig| c.initial_congestion_window = 5000)]
    #[case::retransmissions(|c: &mut GeneConfig| c.max_retransmissions = 0)]
    #[case::tick(|c: &mut GeneConfig| c.tick_interval = Duration::ZERO)]
    #[case::relay_cost(|c: &mut GeneConfig| c.relay.forward_cost = 0)]
    #[case::relay_limits(|c: &mut GeneConfig| c.relay.max_relay_exchanges = 2000)]
    #[case::relay_id_space(|c: &mut GeneConfig| c.relay.max_parallel_relays = 20_000)]
    fn test_validate_rejects(#[case] modify: fn(&mut GeneConfig)) {
        let mut config = GeneConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
