use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::clock::{duration_to_mics, Mics};
use crate::config::GeneConfig;
use crate::flow::congestion::CongestionWindow;
use crate::flow::rtt::{Backoff, RttEstimator};

/// A gene waiting to be sent, identified by transmission and serial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedGene {
    pub transmission_id: u32,
    pub serial: u32,
}

/// Snapshot of a connection's send statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub sent_genes: u64,
    pub sent_bytes: u64,
    pub resent_genes: u64,
    pub loss_signals: u64,
    pub genes_in_flight: u32,
    pub cwnd: u32,
    pub smoothed_rtt_mics: Mics,
    pub rto_mics: Mics,
}

struct FlowState {
    rtt: RttEstimator,
    cwnd: CongestionWindow,
    last_decrease: Option<Mics>,
}

struct SendQueues {
    new_genes: mpsc::UnboundedReceiver<QueuedGene>,
    resends: mpsc::UnboundedReceiver<QueuedGene>,
}

/// Flow control is shared by all transmissions of a connection. It admits genes for sending
///  based on the congestion window, and it turns acks and loss signals into RTT, RTO and
///  congestion window updates.
///
/// Registering a gene for sending is lock free, so transmissions can enqueue genes
///  concurrently. Sending happens from the connection's flush, which drains the queues
///  subject to admission: retransmissions are always admitted since their genes are already
///  in flight, new genes only while the window has room.
pub struct FlowControl {
    new_genes_tx: mpsc::UnboundedSender<QueuedGene>,
    resends_tx: mpsc::UnboundedSender<QueuedGene>,
    queues: Mutex<SendQueues>,

    queued: AtomicUsize,
    in_flight: AtomicU32,
    cwnd: AtomicU32,
    rto_mics: AtomicU64,
    smoothed_rtt_mics: AtomicU64,

    sent_genes: AtomicU64,
    sent_bytes: AtomicU64,
    resent_genes: AtomicU64,
    loss_signals: AtomicU64,

    rto_variance_factor: u32,
    min_rto: Mics,
    max_rto: Mics,
    state: Mutex<FlowState>,
}

impl FlowControl {
    pub fn new(config: &GeneConfig) -> FlowControl {
        let (new_genes_tx, new_genes) = mpsc::unbounded_channel();
        let (resends_tx, resends) = mpsc::unbounded_channel();

        let rtt = RttEstimator::new(duration_to_mics(config.initial_rtt));
        let cwnd = CongestionWindow::new(config.initial_congestion_window, config.max_congestion_window);
        let min_rto = duration_to_mics(config.min_rto);
        let max_rto = duration_to_mics(config.max_rto);

        FlowControl {
            new_genes_tx,
            resends_tx,
            queues: Mutex::new(SendQueues { new_genes, resends }),
            queued: AtomicUsize::new(0),
            in_flight: AtomicU32::new(0),
            cwnd: AtomicU32::new(cwnd.cwnd()),
            rto_mics: AtomicU64::new(rtt.rto(config.rto_variance_factor, min_rto, max_rto)),
            smoothed_rtt_mics: AtomicU64::new(rtt.smoothed()),
            sent_genes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            resent_genes: AtomicU64::new(0),
            loss_signals: AtomicU64::new(0),
            rto_variance_factor: config.rto_variance_factor,
            min_rto,
            max_rto,
            state: Mutex::new(FlowState {
                rtt,
                cwnd,
                last_decrease: None,
            }),
        }
    }

    /// Registers a new gene for sending. This never blocks.
    pub fn add_send_lock_free(&self, gene: QueuedGene) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        // the receiver lives as long as self, so sending can not fail
        let _ = self.new_genes_tx.send(gene);
    }

    /// Registers a gene for retransmission. This never blocks.
    pub fn add_resend_lock_free(&self, gene: QueuedGene) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let _ = self.resends_tx.send(gene);
    }

    /// The next gene to send, if any is queued and admitted by the congestion window
    pub fn pop_sendable(&self) -> Option<QueuedGene> {
        let mut queues = self.queues.lock()
            .unwrap_or_else(PoisonError::into_inner);

        let result = match queues.resends.try_recv() {
            Ok(gene) => Some(gene),
            Err(_) => {
                if self.in_flight() >= self.cwnd() {
                    return None;
                }
                queues.new_genes.try_recv().ok()
            }
        };

        if result.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd.load(Ordering::Acquire)
    }

    pub fn rto(&self) -> Mics {
        self.rto_mics.load(Ordering::Acquire)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            rto: self.rto(),
            min_rto: self.min_rto,
            max_rto: self.max_rto,
        }
    }

    pub fn smoothed_rtt(&self) -> Mics {
        self.smoothed_rtt_mics.load(Ordering::Acquire)
    }

    /// Accounts for a datagram that was handed to the socket. Only a gene's first send adds to
    ///  the genes in flight.
    pub fn on_sent(&self, first_send: bool, num_bytes: usize) {
        self.sent_genes.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);
        if first_send {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        else {
            self.resent_genes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Processes newly acknowledged genes, with RTT samples for those genes that were sent only
    ///  once
    pub fn on_acked(&self, num_acked: u32, rtt_samples: &[Mics]) {
        if num_acked == 0 {
            return;
        }
        let in_flight_before = self.in_flight();
        self.release_in_flight(num_acked);

        let mut state = self.state.lock()
            .unwrap_or_else(PoisonError::into_inner);
        for &sample in rtt_samples {
            state.rtt.update(sample);
        }
        for _ in 0..num_acked {
            state.cwnd.on_ack(in_flight_before);
        }

        self.publish(&state);
        trace!("{} genes acked, {} in flight, cwnd {}", num_acked, self.in_flight(), state.cwnd.cwnd());
    }

    /// A loss signal, i.e. a lost gene report, a retransmission timeout or the packet threshold.
    ///  The window is decreased at most once per smoothed RTT, since all losses within that
    ///  period belong to the same congestion event. Returns `true` if the window was decreased.
    pub fn on_loss(&self, now: Mics) -> bool {
        self.loss_signals.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = state.last_decrease {
            if now.saturating_sub(last) < state.rtt.smoothed() {
                trace!("loss within the same round trip as the previous decrease - ignoring");
                return false;
            }
        }

        state.cwnd.on_loss();
        state.last_decrease = Some(now);
        self.publish(&state);
        true
    }

    /// Genes that left the window without an ack, e.g. because their transmission was canceled
    pub fn on_released(&self, num_genes: u32) {
        if num_genes > 0 {
            debug!("releasing {} genes in flight without ack", num_genes);
            self.release_in_flight(num_genes);
        }
    }

    fn release_in_flight(&self, num_genes: u32) {
        let _ = self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(num_genes)));
    }

    fn publish(&self, state: &FlowState) {
        self.cwnd.store(state.cwnd.cwnd(), Ordering::Release);
        self.smoothed_rtt_mics.store(state.rtt.smoothed(), Ordering::Release);
        self.rto_mics.store(state.rtt.rto(self.rto_variance_factor, self.min_rto, self.max_rto), Ordering::Release);
    }

    pub fn stats(&self) -> FlowStats {
        FlowStats {
            sent_genes: self.sent_genes.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            resent_genes: self.resent_genes.load(Ordering::Relaxed),
            loss_signals: self.loss_signals.load(Ordering::Relaxed),
            genes_in_flight: self.in_flight(),
            cwnd: self.cwnd(),
            smoothed_rtt_mics: self.smoothed_rtt(),
            rto_mics: self.rto(),
        }
    }
}
