use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::buffers::gene_buf::GeneOwner;
use crate::clock::{duration_to_mics, Mics};
use crate::error::{FrameError, TransmissionError};
use crate::frames::{AckFrame, AckRecord, FirstGeneFrame, FollowingGeneFrame, GeneRange, LostGeneFrame, StreamControl, StreamFrame, TransmissionControl, TransmissionMode};
use crate::gene::receive_gene::ReceiveGene;
use crate::gene::window::GeneWindow;
use crate::relay::RELAY_HEADER_LEN;
use crate::transmission::state::{TransmissionCore, TransmissionState};
use crate::transmission::stream::StreamReceiver;
use crate::transmission::TransmissionContext;

/// Transmission metadata from the first gene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveMetadata {
    pub mode: TransmissionMode,
    /// total number of genes for a block, maximum length in bytes for a stream
    pub length: u32,
    pub data_kind: u32,
    pub data_id: u64,
}

impl From<&FirstGeneFrame> for ReceiveMetadata {
    fn from(frame: &FirstGeneFrame) -> Self {
        ReceiveMetadata {
            mode: frame.mode,
            length: frame.length,
            data_kind: frame.data_kind,
            data_id: frame.data_id,
        }
    }
}

/// Something the application needs to know about
pub enum ReceiveEvent {
    /// A block was reassembled completely
    Block { data_kind: u32, data_id: u64, payload: Bytes },
    /// The first gene of a stream arrived, data follows through the receiver
    Stream { data_kind: u32, data_id: u64, receiver: StreamReceiver },
}

/// The result of processing a received gene
#[derive(Default)]
pub struct GeneReceipt {
    pub ack_immediately: bool,
    pub event: Option<ReceiveEvent>,
}

impl GeneReceipt {
    fn ack_now() -> GeneReceipt {
        GeneReceipt {
            ack_immediately: true,
            event: None,
        }
    }
}

struct ReceiveTransmissionInner {
    /// `None` until the first gene arrived - following genes may overtake it
    metadata: Option<ReceiveMetadata>,
    /// The window's base is the successive received position: received genes are popped from
    ///  the front as soon as they are contiguous
    window: GeneWindow<ReceiveGene>,

    assembled: BytesMut,
    received_bytes: u64,
    chunks_tx: Option<mpsc::UnboundedSender<Bytes>>,
    chunks_rx: Option<mpsc::UnboundedReceiver<Bytes>>,

    /// Serials between the base and the highest received gene that were not received yet, with
    ///  the tick counter value of the time their absence was noticed. A gap is reported as lost
    ///  only from the second tick after it was noticed, giving reordered genes a tick's time
    ///  to arrive.
    missing: BTreeMap<u32, u64>,
    tick_counter: u64,

    ack_pending: bool,
    last_activity: Mics,
}

/// The receiving side of a transmission: reassembles genes into a block, or hands them to a
///  stream reader in order.
pub struct ReceiveTransmission {
    core: TransmissionCore,
    ctx: Arc<TransmissionContext>,
    inner: Mutex<ReceiveTransmissionInner>,
}

impl ReceiveTransmission {
    pub fn new(id: u32, ctx: Arc<TransmissionContext>) -> ReceiveTransmission {
        let core = TransmissionCore::new(id);
        core.transition(TransmissionState::AwaitingAck);

        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let inner = ReceiveTransmissionInner {
            metadata: None,
            window: GeneWindow::new(ctx.config.gene_window_size),
            assembled: BytesMut::new(),
            received_bytes: 0,
            chunks_tx: Some(chunks_tx),
            chunks_rx: Some(chunks_rx),
            missing: BTreeMap::new(),
            tick_counter: 0,
            ack_pending: false,
            last_activity: ctx.now(),
        };

        ReceiveTransmission {
            core,
            ctx,
            inner: Mutex::new(inner),
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn state(&self) -> TransmissionState {
        self.core.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.core.is_terminal()
    }

    pub fn outcome(&self) -> Option<Result<(), TransmissionError>> {
        self.core.outcome()
    }

    pub fn metadata(&self) -> Option<ReceiveMetadata> {
        self.lock_inner().metadata
    }

    fn lock_inner(&self) -> MutexGuard<'_, ReceiveTransmissionInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_first_gene(self: &Arc<Self>, frame: &FirstGeneFrame, datagram: &GeneOwner, payload_offset: usize, now: Mics) -> Result<GeneReceipt, TransmissionError> {
        let metadata = ReceiveMetadata::from(frame);

        // the reader is created outside the lock since dropping it cancels the transmission
        let (mut receipt, opened_chunks) = {
            let mut inner = self.lock_inner();
            if self.core.is_terminal() {
                return Ok(self.terminal_receipt(&mut inner));
            }

            let mut opened_chunks = None;
            let existing = inner.metadata;
            match existing {
                Some(existing) if existing != metadata => {
                    return Err(FrameError::InconsistentMetadata.into());
                }
                Some(_) => {}
                None => {
                    self.validate(&metadata, &inner)?;
                    debug!("transmission {}: {:?} of kind {} / id {}, length {}", self.id(), metadata.mode, metadata.data_kind, metadata.data_id, metadata.length);
                    inner.metadata = Some(metadata);

                    match metadata.mode {
                        TransmissionMode::Stream => opened_chunks = inner.chunks_rx.take(),
                        TransmissionMode::Block => {
                            inner.chunks_tx = None;
                            inner.chunks_rx = None;
                        }
                    }
                }
            }

            let receipt = self.on_gene(&mut inner, 0, frame.control, datagram, payload_offset, now)?;
            (receipt, opened_chunks)
        };

        if let Some(chunks) = opened_chunks {
            receipt.event = Some(ReceiveEvent::Stream {
                data_kind: metadata.data_kind,
                data_id: metadata.data_id,
                receiver: StreamReceiver::new(self.clone(), chunks),
            });
        }
        Ok(receipt)
    }

    fn validate(&self, metadata: &ReceiveMetadata, inner: &ReceiveTransmissionInner) -> Result<(), TransmissionError> {
        let config = &self.ctx.config;
        match metadata.mode {
            TransmissionMode::Block => {
                if metadata.length == 0 {
                    return Err(FrameError::InvalidDataPosition { serial: 0, limit: 0 }.into());
                }
                let gene_payload_len = config.gene_payload_len();
                let max_genes = config.max_block_length.div_ceil(gene_payload_len).max(1);
                if metadata.length as usize > max_genes {
                    return Err(TransmissionError::TooLarge {
                        len: (metadata.length as usize).saturating_mul(gene_payload_len),
                        max: config.max_block_length,
                    });
                }
                // genes that overtook the first gene
                if inner.window.end() > metadata.length {
                    return Err(FrameError::InvalidDataPosition { serial: inner.window.end() - 1, limit: metadata.length }.into());
                }
            }
            TransmissionMode::Stream => {
                if metadata.length > config.max_stream_length {
                    return Err(TransmissionError::StreamLengthExceeded { max_length: config.max_stream_length });
                }
            }
        }
        Ok(())
    }

    pub fn on_following_gene(&self, frame: &FollowingGeneFrame, datagram: &GeneOwner, payload_offset: usize, now: Mics) -> Result<GeneReceipt, TransmissionError> {
        if frame.data_position == 0 {
            return Err(FrameError::InvalidDataPosition { serial: 0, limit: 0 }.into());
        }
        let mut inner = self.lock_inner();
        if self.core.is_terminal() {
            return Ok(self.terminal_receipt(&mut inner));
        }
        self.on_gene(&mut inner, frame.data_position, frame.control, datagram, payload_offset, now)
    }

    /// A completed transmission re-acknowledges duplicates, since they mean its ack was lost
    fn terminal_receipt(&self, inner: &mut ReceiveTransmissionInner) -> GeneReceipt {
        if self.core.state() == TransmissionState::Completed {
            inner.ack_pending = true;
            GeneReceipt::ack_now()
        }
        else {
            GeneReceipt::default()
        }
    }

    fn on_gene(&self, inner: &mut ReceiveTransmissionInner, serial: u32, control: TransmissionControl, datagram: &GeneOwner, payload_offset: usize, now: Mics) -> Result<GeneReceipt, TransmissionError> {
        inner.last_activity = now;

        if let Some(metadata) = &inner.metadata {
            if metadata.mode == TransmissionMode::Block && serial >= metadata.length {
                return Err(FrameError::InvalidDataPosition { serial, limit: metadata.length }.into());
            }
        }

        if serial < inner.window.base() {
            trace!("transmission {}: duplicate gene #{}", self.id(), serial);
            inner.ack_pending = true;
            return Ok(GeneReceipt::ack_now());
        }

        let old_end = inner.window.end();
        if !inner.window.extend_to(serial, ReceiveGene::placeholder) {
            debug!("transmission {}: gene #{} is beyond the receive window - dropping", self.id(), serial);
            return Ok(GeneReceipt::default());
        }
        let tick = inner.tick_counter;
        for noticed in old_end..serial {
            inner.missing.insert(noticed, tick);
        }
        let filled_gap = inner.missing.remove(&serial).is_some();

        let Some(slot) = inner.window.get_mut(serial) else {
            return Ok(GeneReceipt::default());
        };
        if !slot.set_recv(datagram, payload_offset) {
            inner.ack_pending = true;
            return Ok(GeneReceipt::ack_now());
        }
        trace!("transmission {}: received gene #{}", self.id(), serial);
        inner.ack_pending = true;

        let event = self.deliver(inner)?;
        Ok(GeneReceipt {
            ack_immediately: control.contains(TransmissionControl::ACK_IMMEDIATELY) || filled_gap || event.is_some(),
            event,
        })
    }

    /// Moves contiguous genes out of the window, completing a block when its last gene is in
    fn deliver(&self, inner: &mut ReceiveTransmissionInner) -> Result<Option<ReceiveEvent>, TransmissionError> {
        let Some(metadata) = inner.metadata else {
            return Ok(None);
        };

        for gene in inner.window.pop_front_while(|g| g.is_received()) {
            match metadata.mode {
                TransmissionMode::Block => {
                    if let Some(payload) = gene.payload() {
                        inner.assembled.extend_from_slice(payload);
                    }
                }
                TransmissionMode::Stream => {
                    inner.received_bytes += gene.payload_len() as u64;
                    if inner.received_bytes > metadata.length as u64 {
                        return Err(TransmissionError::StreamLengthExceeded { max_length: metadata.length });
                    }
                    if let (Some(chunk), Some(chunks_tx)) = (gene.payload_bytes(), &inner.chunks_tx) {
                        if !chunk.is_empty() {
                            // the reader may be gone, its drop cancels the transmission
                            let _ = chunks_tx.send(chunk);
                        }
                    }
                }
            }
        }

        if metadata.mode == TransmissionMode::Block && inner.window.base() >= metadata.length {
            let payload = inner.assembled.split().freeze();
            debug!("transmission {}: block of {} bytes complete", self.id(), payload.len());
            self.core.transition(TransmissionState::Completed);
            self.dispose(inner);
            return Ok(Some(ReceiveEvent::Block {
                data_kind: metadata.data_kind,
                data_id: metadata.data_id,
                payload,
            }));
        }
        Ok(None)
    }

    /// The maximum number of received ranges that fit into an ack datagram with a single record
    fn max_ack_ranges(&self) -> usize {
        let fixed = RELAY_HEADER_LEN + AckFrame::HEADER_LEN + 3 * size_of::<u32>() + size_of::<u32>();
        self.ctx.config.max_frame_length.saturating_sub(fixed) / (2 * size_of::<u32>())
    }

    fn ack_record(&self, inner: &ReceiveTransmissionInner) -> AckRecord {
        let mut received_ranges: Vec<GeneRange> = Vec::new();
        for (serial, gene) in inner.window.iter() {
            if !gene.is_received() {
                continue;
            }
            match received_ranges.last_mut() {
                Some(range) if range.end == serial => range.end += 1,
                _ => received_ranges.push(GeneRange { start: serial, end: serial + 1 }),
            }
        }
        received_ranges.truncate(self.max_ack_ranges());

        AckRecord {
            transmission_id: self.id(),
            successive_received_position: inner.window.base(),
            receive_capacity: inner.window.capacity(),
            received_ranges,
        }
    }

    /// The ack record if anything was received since the last ack
    pub fn take_ack(&self) -> Option<AckRecord> {
        let mut inner = self.lock_inner();
        if !inner.ack_pending {
            return None;
        }
        inner.ack_pending = false;
        Some(self.ack_record(&inner))
    }

    /// The current ack record, regardless of whether anything changed
    pub fn current_ack(&self) -> AckRecord {
        self.ack_record(&self.lock_inner())
    }

    /// Periodic housekeeping: the first gap that was missing for a full tick is reported as
    ///  lost, and an inactive transmission times out
    pub fn on_tick(&self, now: Mics) {
        let mut inner = self.lock_inner();
        if self.core.is_terminal() {
            return;
        }

        let timeout = duration_to_mics(self.ctx.config.transmission_timeout);
        if now.saturating_sub(inner.last_activity) > timeout {
            debug!("transmission {}: nothing received for {} mics", self.id(), timeout);
            if self.core.transition(TransmissionState::TimedOut) {
                self.dispose(&mut inner);
            }
            return;
        }

        inner.tick_counter += 1;
        let threshold = inner.tick_counter - 1;

        let mut gap: Option<(u32, u32)> = None;
        for (&serial, &noticed) in &inner.missing {
            if noticed >= threshold {
                if gap.is_some() {
                    break;
                }
                continue;
            }
            match gap {
                None => gap = Some((serial, serial + 1)),
                Some((start, end)) if end == serial => gap = Some((start, end + 1)),
                Some(_) => break,
            }
        }

        if let Some((first_lost, first_acked)) = gap {
            trace!("transmission {}: genes {}..{} missing", self.id(), first_lost, first_acked);
            let frame = LostGeneFrame {
                transmission_id: self.id(),
                first_lost,
                first_acked,
            };
            self.ctx.send_control(&frame, LostGeneFrame::LEN);
        }
    }

    /// Stream control frame from the sender. Returns `true` if this completed the transmission.
    pub fn on_stream_frame(&self, frame: &StreamFrame) -> bool {
        let mut inner = self.lock_inner();
        match frame.control {
            StreamControl::Complete => {
                if self.core.state() == TransmissionState::Completed {
                    // our confirmation was lost
                    self.send_stream_frame(StreamControl::Complete);
                    return false;
                }
                if self.core.is_terminal() {
                    return false;
                }
                if inner.metadata.map(|m| m.mode) != Some(TransmissionMode::Stream) {
                    warn!("transmission {}: completion for a transmission that is not a stream", self.id());
                    return false;
                }
                if !inner.window.is_empty() {
                    debug!("transmission {}: completion while genes are missing - waiting for the sender to repeat it", self.id());
                    return false;
                }

                debug!("transmission {}: stream complete after {} bytes", self.id(), inner.received_bytes);
                self.core.transition(TransmissionState::Completed);
                self.dispose(&mut inner);
                self.send_stream_frame(StreamControl::Complete);
                true
            }
            StreamControl::Cancel => {
                debug!("transmission {}: canceled by the sender", self.id());
                if self.core.transition(TransmissionState::Canceled) {
                    self.dispose(&mut inner);
                }
                false
            }
        }
    }

    /// The reading side gives up on the transmission and tells the sender to stop
    pub fn cancel_by_receiver(&self) {
        let mut inner = self.lock_inner();
        if self.core.transition(TransmissionState::Canceled) {
            self.dispose(&mut inner);
            self.send_stream_frame(StreamControl::Cancel);
        }
    }

    /// Cancels with a specific reason, e.g. a closed connection or a protocol violation
    pub fn abort(&self, reason: TransmissionError, notify_peer: bool) {
        let mut inner = self.lock_inner();
        if self.core.cancel_with(reason) {
            self.dispose(&mut inner);
            if notify_peer {
                self.send_stream_frame(StreamControl::Cancel);
            }
        }
    }

    fn send_stream_frame(&self, control: StreamControl) {
        let frame = StreamFrame {
            transmission_id: self.id(),
            control,
            from_receiver: true,
        };
        self.ctx.send_control(&frame, StreamFrame::LEN);
    }

    fn dispose(&self, inner: &mut ReceiveTransmissionInner) {
        if !self.core.dispose_once() {
            return;
        }
        for mut gene in inner.window.drain() {
            gene.dispose();
        }
        inner.assembled = BytesMut::new();
        inner.missing.clear();
        // ends the reader's chunk sequence
        inner.chunks_tx = None;
        inner.chunks_rx = None;
        trace!("transmission {}: disposed", self.id());
    }
}
