use std::cmp::min;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use bytes::{Buf, BufMut, Bytes};
use tracing::{debug, trace, warn};
use crate::clock::{duration_to_mics, Mics};
use crate::error::TransmissionError;
use crate::frames::{AckRecord, FirstGeneFrame, FollowingGeneFrame, LostGeneFrame, StreamControl, StreamFrame, TransmissionControl, TransmissionMode, WireFrame};
use crate::gene::send_gene::SendGene;
use crate::gene::window::GeneWindow;
use crate::safe_converter::{PrecheckedCast, SaturatingCast};
use crate::transmission::state::{TransmissionCore, TransmissionState};
use crate::transmission::TransmissionContext;

/// A gene is considered lost if it is still unacknowledged when a gene at least this many
///  serials later was acknowledged
const PACKET_THRESHOLD: u32 = 3;

struct SendTransmissionInner {
    window: GeneWindow<SendGene>,
    /// data that was not packed into genes yet
    pending: VecDeque<Bytes>,
    pending_len: usize,
    next_serial: u32,
    /// number of genes registered with flow control and not popped for sending yet
    queued_genes: u32,

    /// block: number of genes, stream: maximum length in bytes
    length: u32,
    /// total number of bytes handed to the stream
    written: u64,
    completing: bool,
    /// stream completion frame: next resend and number of sends
    complete_deadline: Option<Mics>,
    complete_sends: u32,

    /// the receiver's successive received position
    ack_base: u32,
    receive_capacity: u32,
    highest_acked: Option<u32>,
    last_progress: Mics,
}

/// The sending side of a transmission.
///
/// Payload is cut into genes lazily, as far as the gene window and the receiver's capacity
///  allow. Genes are registered with the connection's flow control and put on the wire by the
///  connection's flush, so the transmission itself never waits for the congestion window.
pub struct SendTransmission {
    core: TransmissionCore,
    ctx: Arc<TransmissionContext>,
    mode: TransmissionMode,
    data_kind: u32,
    data_id: u64,
    inner: Mutex<SendTransmissionInner>,
}

impl SendTransmission {
    pub fn new_block(id: u32, ctx: Arc<TransmissionContext>, data_kind: u32, data_id: u64, payload: Bytes) -> Result<SendTransmission, TransmissionError> {
        let max = ctx.config.max_block_length;
        if payload.len() > max {
            return Err(TransmissionError::TooLarge { len: payload.len(), max });
        }

        let num_genes = payload.len()
            .div_ceil(ctx.config.gene_payload_len())
            .max(1);
        let length: u32 = num_genes.prechecked_cast();

        let mut pending = VecDeque::new();
        let pending_len = payload.len();
        if !payload.is_empty() {
            pending.push_back(payload);
        }

        Ok(Self::new(id, ctx, TransmissionMode::Block, data_kind, data_id, length, pending, pending_len))
    }

    pub fn new_stream(id: u32, ctx: Arc<TransmissionContext>, data_kind: u32, data_id: u64, max_length: u32) -> SendTransmission {
        Self::new(id, ctx, TransmissionMode::Stream, data_kind, data_id, max_length, VecDeque::new(), 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(id: u32, ctx: Arc<TransmissionContext>, mode: TransmissionMode, data_kind: u32, data_id: u64, length: u32, pending: VecDeque<Bytes>, pending_len: usize) -> SendTransmission {
        let window_size = ctx.config.gene_window_size;
        let now = ctx.now();

        SendTransmission {
            core: TransmissionCore::new(id),
            mode,
            data_kind,
            data_id,
            inner: Mutex::new(SendTransmissionInner {
                window: GeneWindow::new(window_size),
                pending,
                pending_len,
                next_serial: 0,
                queued_genes: 0,
                length,
                written: 0,
                completing: mode == TransmissionMode::Block,
                complete_deadline: None,
                complete_sends: 0,
                ack_base: 0,
                receive_capacity: window_size,
                highest_acked: None,
                last_progress: now,
            }),
            ctx,
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn mode(&self) -> TransmissionMode {
        self.mode
    }

    pub fn state(&self) -> TransmissionState {
        self.core.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.core.is_terminal()
    }

    /// Waits for the transmission to complete, i.e. for all genes to be acknowledged (block) or
    ///  for the receiver to confirm completion (stream)
    pub async fn wait(&self) -> Result<(), TransmissionError> {
        self.core.wait().await
    }

    fn lock_inner(&self) -> MutexGuard<'_, SendTransmissionInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts sending: the first window of genes is created and queued for sending
    pub fn start(&self) {
        let mut inner = self.lock_inner();
        if self.core.transition(TransmissionState::Sending) {
            self.fill_window(&mut inner);
        }
    }

    /// Creates genes from pending data while the gene window and the receiver's capacity have
    ///  room
    fn fill_window(&self, inner: &mut SendTransmissionInner) {
        let payload_len = self.ctx.config.gene_payload_len();
        let mut num_created = 0;

        loop {
            if inner.window.is_full() || inner.next_serial >= inner.ack_base.saturating_add(inner.receive_capacity) {
                break;
            }
            let is_first = inner.next_serial == 0;
            match self.mode {
                TransmissionMode::Block => if inner.next_serial >= inner.length {
                    break;
                },
                TransmissionMode::Stream => if inner.pending_len == 0 && !(is_first && inner.completing) {
                    break;
                },
            }

            let serial = inner.next_serial;
            let chunk_len = min(payload_len, inner.pending_len);

            let mut control = TransmissionControl::empty();
            if self.mode == TransmissionMode::Block && serial + 1 == inner.length {
                control |= TransmissionControl::FINAL_GENE;
            }
            let window_exhausted = inner.window.len() + 1 >= inner.window.capacity()
                || serial + 1 >= inner.ack_base.saturating_add(inner.receive_capacity);
            if window_exhausted || inner.pending_len == chunk_len {
                control |= TransmissionControl::ACK_IMMEDIATELY;
            }

            let mut buf;
            if is_first {
                let header = FirstGeneFrame {
                    mode: self.mode,
                    transmission_id: self.id(),
                    control,
                    rtt_hint_mics: self.ctx.flow.smoothed_rtt().saturating_cast(),
                    length: inner.length,
                    data_kind: self.data_kind,
                    data_id: self.data_id,
                };
                buf = self.ctx.rent_datagram(FirstGeneFrame::LEN + chunk_len);
                header.ser(&mut buf);
            }
            else {
                let header = FollowingGeneFrame {
                    transmission_id: self.id(),
                    control,
                    data_position: serial,
                };
                buf = self.ctx.rent_datagram(FollowingGeneFrame::LEN + chunk_len);
                header.ser(&mut buf);
            }

            let mut remaining = chunk_len;
            while remaining > 0 {
                let Some(front) = inner.pending.front_mut() else { break; };
                let n = min(front.len(), remaining);
                buf.put_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    inner.pending.pop_front();
                }
                remaining -= n;
            }
            inner.pending_len -= chunk_len;

            let mut gene = SendGene::new(serial);
            gene.set_send(buf.freeze(), chunk_len, self.id(), &self.ctx.flow);
            inner.queued_genes += 1;
            if inner.window.push_back(gene).is_none() {
                // checked at the top of the loop
                warn!("transmission {}: gene window overflow", self.id());
                break;
            }
            inner.next_serial += 1;
            num_created += 1;
        }

        if num_created > 0 {
            trace!("transmission {}: created {} genes, next serial {}", self.id(), num_created, inner.next_serial);
            self.core.transition(TransmissionState::Sending);
        }
    }

    /// Puts a gene on the wire after flow control admitted it
    pub fn send_queued(&self, serial: u32, now: Mics) {
        let mut inner = self.lock_inner();
        inner.queued_genes = inner.queued_genes.saturating_sub(1);
        if self.core.is_terminal() {
            return;
        }

        let backoff = self.ctx.flow.backoff();
        if let Some(gene) = inner.window.get_mut(serial) {
            let first_send = !gene.is_sent();
            if gene.send(self.ctx.net_sender.as_ref(), self.ctx.route.addr, now, backoff).is_some() {
                self.ctx.flow.on_sent(first_send, gene.payload_len());
            }
        }
        else {
            trace!("transmission {}: gene #{} left the window before it was sent", self.id(), serial);
        }

        if inner.queued_genes == 0 {
            self.core.transition(TransmissionState::AwaitingAck);
        }
    }

    /// Processes the receiver's ack record. Processing is idempotent, so duplicate and
    ///  reordered acks are harmless.
    pub fn on_ack(&self, record: &AckRecord, now: Mics) {
        let mut inner = self.lock_inner();
        if self.core.is_terminal() {
            return;
        }

        let is_acked = |serial: u32| serial < record.successive_received_position
            || record.received_ranges.iter().any(|r| r.start <= serial && serial < r.end);

        let mut num_acked = 0;
        let mut rtt_samples = Vec::new();
        for (serial, gene) in inner.window.iter_mut() {
            if gene.is_acked() || !is_acked(serial) {
                continue;
            }
            let was_in_flight = gene.is_in_flight();
            if let Some(sample) = gene.on_acked(now) {
                rtt_samples.push(sample);
            }
            if was_in_flight {
                num_acked += 1;
            }
        }
        self.ctx.flow.on_acked(num_acked, &rtt_samples);
        inner.window.pop_front_while(|g| g.is_acked());

        let highest = record.received_ranges.last()
            .map(|r| r.end - 1)
            .or(record.successive_received_position.checked_sub(1))
            .map(|h| min(h, inner.next_serial.saturating_sub(1)));
        if highest > inner.highest_acked {
            inner.highest_acked = highest;
        }

        let successive = min(record.successive_received_position, inner.next_serial);
        if num_acked > 0 || successive > inner.ack_base {
            inner.last_progress = now;
        }
        if successive > inner.ack_base {
            inner.ack_base = successive;
        }
        inner.receive_capacity = record.receive_capacity;

        trace!("transmission {}: {} genes acked, receiver at #{}", self.id(), num_acked, inner.ack_base);

        self.detect_packet_threshold_loss(&mut inner, now);

        match self.mode {
            TransmissionMode::Block => {
                if inner.ack_base >= inner.length {
                    debug!("transmission {}: all {} genes acknowledged", self.id(), inner.length);
                    self.core.transition(TransmissionState::Completed);
                    self.dispose(&mut inner);
                    return;
                }
            }
            TransmissionMode::Stream => self.try_send_complete(&mut inner, now),
        }

        self.fill_window(&mut inner);
    }

    fn detect_packet_threshold_loss(&self, inner: &mut SendTransmissionInner, now: Mics) {
        let Some(highest) = inner.highest_acked else { return; };

        let mut num_lost = 0;
        for (serial, gene) in inner.window.iter_mut() {
            if serial.saturating_add(PACKET_THRESHOLD) > highest {
                break;
            }
            // genes that were resent already are left to their resend deadline
            if gene.is_in_flight() && gene.send_count() == 1 && gene.queue_resend(self.core.id(), &self.ctx.flow) {
                num_lost += 1;
            }
        }

        if num_lost > 0 {
            debug!("transmission {}: {} genes lost by packet threshold", self.id(), num_lost);
            inner.queued_genes += num_lost;
            self.ctx.flow.on_loss(now);
            self.core.transition(TransmissionState::Sending);
        }
    }

    /// Retransmits genes the receiver reported as lost, unless they were sent less than one
    ///  round trip ago
    pub fn on_lost_gene(&self, frame: &LostGeneFrame, now: Mics) {
        let mut inner = self.lock_inner();
        if self.core.is_terminal() {
            return;
        }

        let smoothed_rtt = self.ctx.flow.smoothed_rtt();
        let mut num_lost = 0;
        for (serial, gene) in inner.window.iter_mut() {
            if serial < frame.first_lost {
                continue;
            }
            if serial >= frame.first_acked {
                break;
            }
            let sent_long_enough = gene.sent_mics()
                .map(|sent| sent.saturating_add(smoothed_rtt) <= now)
                .unwrap_or(false);
            if gene.is_in_flight() && sent_long_enough && gene.queue_resend(self.core.id(), &self.ctx.flow) {
                num_lost += 1;
            }
        }

        if num_lost > 0 {
            debug!("transmission {}: resending {} genes reported lost", self.id(), num_lost);
            inner.queued_genes += num_lost;
            self.ctx.flow.on_loss(now);
            self.core.transition(TransmissionState::Sending);
        }
    }

    /// Periodic housekeeping: retransmission timeouts, the retransmission budget and the
    ///  overall transmission timeout
    pub fn on_tick(&self, now: Mics) {
        let mut inner = self.lock_inner();
        if self.core.is_terminal() {
            return;
        }

        let timeout = duration_to_mics(self.ctx.config.transmission_timeout);
        if now.saturating_sub(inner.last_progress) > timeout {
            debug!("transmission {}: no progress for {} mics", self.id(), timeout);
            self.time_out(&mut inner);
            return;
        }

        let max_retransmissions = self.ctx.config.max_retransmissions;
        let mut num_lost = 0;
        let mut budget_exhausted = false;
        for (_, gene) in inner.window.iter_mut() {
            let Some(deadline) = gene.resend_deadline() else { continue; };
            if deadline > now || !gene.is_in_flight() {
                continue;
            }
            if gene.send_count() > max_retransmissions {
                budget_exhausted = true;
                break;
            }
            if gene.queue_resend(self.core.id(), &self.ctx.flow) {
                num_lost += 1;
            }
        }
        if budget_exhausted {
            debug!("transmission {}: retransmission budget of {} exhausted", self.id(), max_retransmissions);
            self.time_out(&mut inner);
            return;
        }
        if num_lost > 0 {
            debug!("transmission {}: {} genes hit their retransmission timeout", self.id(), num_lost);
            inner.queued_genes += num_lost;
            self.ctx.flow.on_loss(now);
            self.core.transition(TransmissionState::Sending);
        }

        if let Some(deadline) = inner.complete_deadline {
            if deadline <= now {
                if inner.complete_sends > max_retransmissions {
                    debug!("transmission {}: stream completion was never confirmed", self.id());
                    self.time_out(&mut inner);
                    return;
                }
                self.send_complete(&mut inner, now);
            }
        }

        self.fill_window(&mut inner);
    }

    /// Appends data to a stream
    pub fn write(&self, data: Bytes) -> Result<(), TransmissionError> {
        let mut inner = self.lock_inner();
        if let Some(outcome) = self.core.outcome() {
            return Err(outcome.err().unwrap_or(TransmissionError::AlreadyCompleted));
        }
        if self.mode != TransmissionMode::Stream || inner.completing {
            return Err(TransmissionError::AlreadyCompleted);
        }

        let new_len = inner.written + data.len() as u64;
        if new_len > inner.length as u64 {
            return Err(TransmissionError::StreamLengthExceeded { max_length: inner.length });
        }
        if data.is_empty() {
            return Ok(());
        }

        inner.written = new_len;
        inner.pending_len += data.len();
        inner.pending.push_back(data);
        self.fill_window(&mut inner);
        Ok(())
    }

    /// Marks the end of a stream. The transmission completes once all data is acknowledged
    ///  and the receiver confirmed the completion.
    pub fn complete(&self) -> Result<(), TransmissionError> {
        let mut inner = self.lock_inner();
        if let Some(outcome) = self.core.outcome() {
            return outcome;
        }
        if self.mode != TransmissionMode::Stream || inner.completing {
            return Ok(());
        }

        inner.completing = true;
        // an empty stream still needs its first gene to announce the transmission
        self.fill_window(&mut inner);
        let now = self.ctx.now();
        self.try_send_complete(&mut inner, now);
        Ok(())
    }

    fn try_send_complete(&self, inner: &mut SendTransmissionInner, now: Mics) {
        let all_acked = inner.pending_len == 0 && inner.window.is_empty() && inner.next_serial > 0;
        if inner.completing && all_acked && inner.complete_deadline.is_none() {
            self.send_complete(inner, now);
        }
    }

    fn send_complete(&self, inner: &mut SendTransmissionInner, now: Mics) {
        let frame = StreamFrame {
            transmission_id: self.id(),
            control: StreamControl::Complete,
            from_receiver: false,
        };
        self.ctx.send_control(&frame, StreamFrame::LEN);

        inner.complete_sends += 1;
        let timeout = self.ctx.flow.backoff().timeout(inner.complete_sends);
        inner.complete_deadline = Some(now.saturating_add(timeout));
    }

    /// Stream control frame sent by the receiver
    pub fn on_stream_frame(&self, frame: &StreamFrame) {
        let mut inner = self.lock_inner();
        match frame.control {
            StreamControl::Complete => {
                if inner.complete_deadline.is_none() {
                    warn!("transmission {}: receiver confirmed a completion that was never sent", self.id());
                    return;
                }
                if self.core.transition(TransmissionState::Completed) {
                    self.dispose(&mut inner);
                }
            }
            StreamControl::Cancel => {
                debug!("transmission {}: canceled by the receiver", self.id());
                if self.core.transition(TransmissionState::Canceled) {
                    self.dispose(&mut inner);
                }
            }
        }
    }

    /// Cancels the transmission and tells the receiver to discard it
    pub fn cancel(&self) {
        self.abort(TransmissionError::Canceled, true);
    }

    /// Cancels with a specific reason, optionally notifying the receiver
    pub fn abort(&self, reason: TransmissionError, notify_peer: bool) {
        let mut inner = self.lock_inner();
        if !self.core.cancel_with(reason) {
            return;
        }
        self.dispose(&mut inner);
        if notify_peer {
            self.send_cancel();
        }
    }

    fn time_out(&self, inner: &mut SendTransmissionInner) {
        if self.core.transition(TransmissionState::TimedOut) {
            self.dispose(inner);
            self.send_cancel();
        }
    }

    fn send_cancel(&self) {
        let frame = StreamFrame {
            transmission_id: self.id(),
            control: StreamControl::Cancel,
            from_receiver: false,
        };
        self.ctx.send_control(&frame, StreamFrame::LEN);
    }

    /// Releases all buffers exactly once, and hands genes that are still in flight back to
    ///  flow control
    fn dispose(&self, inner: &mut SendTransmissionInner) {
        if !self.core.dispose_once() {
            return;
        }
        let in_flight = inner.window.iter()
            .filter(|(_, g)| g.is_in_flight())
            .count();
        self.ctx.flow.on_released(in_flight.prechecked_cast());

        for mut gene in inner.window.drain() {
            gene.dispose();
        }
        inner.pending.clear();
        inner.pending_len = 0;
        trace!("transmission {}: disposed", self.id());
    }

    /// lowest serial that is not acknowledged yet, and the number of genes in the window
    pub fn window_position(&self) -> (u32, u32) {
        let inner = self.lock_inner();
        (inner.window.base(), inner.window.len())
    }
}
