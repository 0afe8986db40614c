use std::net::SocketAddr;
use tracing::trace;
use crate::buffers::gene_buf::GeneOwner;
use crate::clock::Mics;
use crate::flow::flow_control::{FlowControl, QueuedGene};
use crate::flow::rtt::Backoff;
use crate::net_sender::NetSender;

/// A gene on the sending side. It holds the complete datagram (relay header, frame header and
///  payload), so retransmissions re-send the pooled bytes without serializing again.
#[derive(Debug)]
pub struct SendGene {
    serial: u32,
    datagram: Option<GeneOwner>,
    payload_len: usize,
    sent_mics: Option<Mics>,
    send_count: u32,
    resend_deadline: Option<Mics>,
    acked: bool,
    queued: bool,
}

impl SendGene {
    pub fn new(serial: u32) -> SendGene {
        SendGene {
            serial,
            datagram: None,
            payload_len: 0,
            sent_mics: None,
            send_count: 0,
            resend_deadline: None,
            acked: false,
            queued: false,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Attaches the datagram and registers the gene for sending
    pub fn set_send(&mut self, datagram: GeneOwner, payload_len: usize, transmission_id: u32, flow: &FlowControl) {
        self.datagram = Some(datagram);
        self.payload_len = payload_len;
        self.queued = true;
        flow.add_send_lock_free(QueuedGene { transmission_id, serial: self.serial });
    }

    /// Puts the datagram on the wire. Returns the retransmission deadline, which backs off
    ///  exponentially with the number of sends, or `None` if there is nothing to send.
    pub fn send(&mut self, net_sender: &dyn NetSender, to: SocketAddr, now: Mics, backoff: Backoff) -> Option<Mics> {
        self.queued = false;
        if self.acked {
            return None;
        }
        let datagram = self.datagram.as_ref()?;

        net_sender.send_datagram(to, datagram);
        self.sent_mics = Some(now);
        self.send_count += 1;

        let deadline = now.saturating_add(backoff.timeout(self.send_count));
        self.resend_deadline = Some(deadline);

        trace!("sent gene #{} (attempt {}), resend deadline {}", self.serial, self.send_count, deadline);
        Some(deadline)
    }

    /// Registers the gene for retransmission unless it is already queued or acknowledged
    pub fn queue_resend(&mut self, transmission_id: u32, flow: &FlowControl) -> bool {
        if self.queued || self.acked || self.datagram.is_none() {
            return false;
        }
        self.queued = true;
        self.resend_deadline = None;
        flow.add_resend_lock_free(QueuedGene { transmission_id, serial: self.serial });
        true
    }

    /// Marks the gene as acknowledged and releases its buffer. Returns the RTT sample if the
    ///  gene was sent exactly once, since the sample is ambiguous for retransmitted genes.
    pub fn on_acked(&mut self, now: Mics) -> Option<Mics> {
        if self.acked {
            return None;
        }
        self.acked = true;
        self.resend_deadline = None;
        self.dispose();

        match (self.send_count, self.sent_mics) {
            (1, Some(sent)) => Some(now.saturating_sub(sent)),
            _ => None,
        }
    }

    /// Releases the buffer, returning it to the pool once no other owner shares it
    pub fn dispose(&mut self) {
        self.datagram = None;
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn is_sent(&self) -> bool {
        self.send_count > 0
    }

    /// sent at least once and neither acknowledged nor disposed
    pub fn is_in_flight(&self) -> bool {
        self.send_count > 0 && !self.acked
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn resend_deadline(&self) -> Option<Mics> {
        self.resend_deadline
    }

    pub fn sent_mics(&self) -> Option<Mics> {
        self.sent_mics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use bytes::BufMut;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::buffers::gene_pool::GenePool;
    use crate::config::GeneConfig;
    use crate::net_sender::MockNetSender;

    fn datagram(pool: &Arc<GenePool>, content: &[u8]) -> GeneOwner {
        let mut buf = pool.rent(content.len());
        buf.put_slice(content);
        buf.freeze()
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 5))
    }

    #[test]
    fn test_set_send_registers_with_flow_control() {
        let pool = Arc::new(GenePool::new(100, 4));
        let flow = FlowControl::new(&GeneConfig::default_ipv4());

        let mut gene = SendGene::new(7);
        gene.set_send(datagram(&pool, b"abc"), 3, 99, &flow);

        assert_eq!(flow.pop_sendable(), Some(QueuedGene { transmission_id: 99, serial: 7 }));
        assert!(!gene.queue_resend(99, &flow), "gene is still queued for its first send");
    }

    #[rstest]
    #[case::first(1, 1000)]
    #[case::second(2, 2000)]
    #[case::third(3, 4000)]
    #[case::capped(5, 10_000)]
    fn test_send_backoff(#[case] num_sends: u32, #[case] expected_timeout: Mics) {
        let pool = Arc::new(GenePool::new(100, 4));
        let flow = FlowControl::new(&GeneConfig::default_ipv4());

        let mut net_sender = MockNetSender::new();
        net_sender.expect_send_datagram()
            .with(eq(addr()), eq(b"abc".as_slice()))
            .times(num_sends as usize)
            .return_const(());

        let mut gene = SendGene::new(0);
        gene.set_send(datagram(&pool, b"abc"), 3, 1, &flow);

        let mut deadline = None;
        for i in 0..num_sends {
            deadline = gene.send(&net_sender, addr(), 50_000 + i as Mics, Backoff { rto: 1000, min_rto: 0, max_rto: 10_000 });
        }
        assert_eq!(deadline, Some(50_000 + (num_sends - 1) as Mics + expected_timeout));
        assert_eq!(gene.send_count(), num_sends);
    }

    #[rstest]
    #[case::single_send(1, Some(300))]
    #[case::resent(2, None)]
    fn test_rtt_sample_only_for_single_send(#[case] num_sends: u32, #[case] expected: Option<Mics>) {
        let pool = Arc::new(GenePool::new(100, 4));
        let flow = FlowControl::new(&GeneConfig::default_ipv4());
        let mut net_sender = MockNetSender::new();
        net_sender.expect_send_datagram().return_const(());

        let mut gene = SendGene::new(0);
        gene.set_send(datagram(&pool, b"abc"), 3, 1, &flow);
        for _ in 0..num_sends {
            gene.send(&net_sender, addr(), 1000, Backoff { rto: 500, min_rto: 0, max_rto: 5000 });
        }

        assert_eq!(gene.on_acked(1300), expected);
        assert!(gene.is_acked());
        assert_eq!(pool.outstanding(), 0, "buffer is released on ack");
        assert_eq!(gene.on_acked(1400), None, "second ack is ignored");
    }

    #[test]
    fn test_acked_gene_is_neither_sent_nor_resent() {
        let pool = Arc::new(GenePool::new(100, 4));
        let flow = FlowControl::new(&GeneConfig::default_ipv4());
        let mut net_sender = MockNetSender::new();
        net_sender.expect_send_datagram().times(1).return_const(());

        let mut gene = SendGene::new(0);
        gene.set_send(datagram(&pool, b"abc"), 3, 1, &flow);
        flow.pop_sendable();
        gene.send(&net_sender, addr(), 0, Backoff { rto: 100, min_rto: 0, max_rto: 1000 });
        gene.on_acked(50);

        assert!(!gene.queue_resend(1, &flow));
        assert_eq!(gene.send(&net_sender, addr(), 60, Backoff { rto: 100, min_rto: 0, max_rto: 1000 }), None);
    }

    #[test]
    fn test_queue_resend_once() {
        let pool = Arc::new(GenePool::new(100, 4));
        let flow = FlowControl::new(&GeneConfig::default_ipv4());
        let mut net_sender = MockNetSender::new();
        net_sender.expect_send_datagram().return_const(());

        let mut gene = SendGene::new(3);
        gene.set_send(datagram(&pool, b"abc"), 3, 1, &flow);
        flow.pop_sendable();
        gene.send(&net_sender, addr(), 0, Backoff { rto: 100, min_rto: 0, max_rto: 1000 });

        assert!(gene.queue_resend(1, &flow));
        assert!(!gene.queue_resend(1, &flow));
        assert_eq!(flow.queued(), 1);
        assert_eq!(gene.resend_deadline(), None);
    }
}
