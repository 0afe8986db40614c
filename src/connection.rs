use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, trace, warn};
use crate::buffers::gene_buf::GeneOwner;
use crate::clock::{duration_to_mics, Mics};
use crate::error::{FrameError, TransmissionError};
use crate::flow::flow_control::FlowStats;
use crate::frames::{peek_frame_type, AckFrame, AckRecord, FirstGeneFrame, FollowingGeneFrame, FrameType, LostGeneFrame, StreamFrame, WireFrame};
use crate::relay::{DIRECT, RELAY_HEADER_LEN};
use crate::transmission::receive_transmission::{GeneReceipt, ReceiveEvent, ReceiveTransmission};
use crate::transmission::send_transmission::SendTransmission;
use crate::transmission::stream::StreamSender;
use crate::transmission::TransmissionContext;

/// Attempts to find an unused transmission id before giving up
const MAX_ID_ATTEMPTS: u32 = 64;

/// How to reach a peer: the address datagrams are sent to, and the relay id they carry. For a
///  relayed peer, the address is the first relay hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRoute {
    pub addr: SocketAddr,
    pub relay_id: u16,
}

impl PeerRoute {
    pub fn direct(addr: SocketAddr) -> PeerRoute {
        PeerRoute { addr, relay_id: DIRECT }
    }

    pub fn relayed(relay_addr: SocketAddr, relay_id: u16) -> PeerRoute {
        PeerRoute { addr: relay_addr, relay_id }
    }

    pub fn is_relayed(&self) -> bool {
        self.relay_id != DIRECT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub flow: FlowStats,
    pub send_transmissions: usize,
    pub receive_transmissions: usize,
    pub protocol_violations: u32,
}

#[derive(Default)]
struct Transmissions {
    send: FxHashMap<u32, Arc<SendTransmission>>,
    receive: FxHashMap<u32, Arc<ReceiveTransmission>>,
    /// receive transmissions that reached a terminal state, and since when. They are kept for
    ///  a while to re-acknowledge late duplicates.
    receive_terminal_since: FxHashMap<u32, Mics>,
}

/// All transmissions between this node and one peer route, sharing one flow control.
///
/// The connection's own lock only guards the transmission tables. It is never held while
///  calling into a transmission, which has its own lock.
pub struct Connection {
    ctx: Arc<TransmissionContext>,
    salt: u64,
    next_transmission_id: AtomicU32,
    transmissions: Mutex<Transmissions>,
    protocol_violations: AtomicU32,
    closed: AtomicBool,
    last_activity: AtomicU64,
}

impl Connection {
    pub fn new(ctx: Arc<TransmissionContext>) -> Connection {
        let salt = rand::random();
        debug!("new connection to {:?} with salt {:016x}", ctx.route, salt);
        let now = ctx.now();
        Connection {
            ctx,
            salt,
            next_transmission_id: AtomicU32::new(rand::random()),
            transmissions: Default::default(),
            protocol_violations: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            last_activity: AtomicU64::new(now),
        }
    }

    pub fn route(&self) -> PeerRoute {
        self.ctx.route
    }

    /// A random value identifying this connection, e.g. for binding relay certificates to it
    pub fn salt(&self) -> u64 {
        self.salt
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &Arc<TransmissionContext> {
        &self.ctx
    }

    /// Records that the connection is in use, keeping it from being evicted as idle
    pub fn touch(&self, now: Mics) {
        self.last_activity.fetch_max(now, Ordering::AcqRel);
    }

    /// A connection is idle when it has no transmissions left and was not used for longer than
    ///  `idle_timeout`
    pub fn is_idle(&self, now: Mics, idle_timeout: Mics) -> bool {
        let transmissions = self.lock_transmissions();
        transmissions.send.is_empty()
            && transmissions.receive.is_empty()
            && now.saturating_sub(self.last_activity.load(Ordering::Acquire)) > idle_timeout
    }

    /// Checks if a datagram from a peer without a connection may open one. Only well-formed
    ///  gene frames do, all other frames refer to existing transmissions.
    pub fn is_opening_datagram(datagram: &[u8]) -> bool {
        let Some(mut frame_buf) = datagram.get(RELAY_HEADER_LEN..) else {
            return false;
        };
        match peek_frame_type(frame_buf) {
            Ok(FrameType::FirstGene) => FirstGeneFrame::deser(&mut frame_buf).is_ok(),
            Ok(FrameType::FollowingGene) => FollowingGeneFrame::deser(&mut frame_buf).is_ok(),
            _ => false,
        }
    }

    fn lock_transmissions(&self) -> MutexGuard<'_, Transmissions> {
        self.transmissions.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send_transmission(&self, id: u32) -> Option<Arc<SendTransmission>> {
        self.lock_transmissions().send.get(&id).cloned()
    }

    fn receive_transmission(&self, id: u32) -> Option<Arc<ReceiveTransmission>> {
        self.lock_transmissions().receive.get(&id).cloned()
    }

    fn receive_transmission_or_new(&self, id: u32) -> Arc<ReceiveTransmission> {
        self.lock_transmissions().receive
            .entry(id)
            .or_insert_with(|| {
                trace!("new receive transmission {} from {:?}", id, self.ctx.route);
                Arc::new(ReceiveTransmission::new(id, self.ctx.clone()))
            })
            .clone()
    }

    /// Registers a new send transmission under an id that is not in use
    fn register_send(&self, create: impl FnOnce(u32) -> Result<SendTransmission, TransmissionError>) -> Result<Arc<SendTransmission>, TransmissionError> {
        if self.is_closed() {
            return Err(TransmissionError::ConnectionClosed);
        }

        let mut transmissions = self.lock_transmissions();
        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| self.next_transmission_id.fetch_add(1, Ordering::AcqRel))
            .find(|id| !transmissions.send.contains_key(id))
            .ok_or(TransmissionError::WindowExhausted)?;

        let transmission = Arc::new(create(id)?);
        transmissions.send.insert(id, transmission.clone());
        Ok(transmission)
    }

    /// Sends a block. The returned transmission completes when the peer acknowledged all of it.
    pub fn send_block(&self, data_kind: u32, data_id: u64, payload: Bytes) -> Result<Arc<SendTransmission>, TransmissionError> {
        let ctx = self.ctx.clone();
        let transmission = self.register_send(|id| SendTransmission::new_block(id, ctx, data_kind, data_id, payload))?;
        debug!("sending block {} to {:?}: kind {}, id {}", transmission.id(), self.ctx.route, data_kind, data_id);

        transmission.start();
        self.flush();
        Ok(transmission)
    }

    /// Opens a stream of at most `max_length` bytes
    pub fn open_stream(self: &Arc<Self>, data_kind: u32, data_id: u64, max_length: u32) -> Result<StreamSender, TransmissionError> {
        let max_stream_length = self.ctx.config.max_stream_length;
        if max_length > max_stream_length {
            return Err(TransmissionError::StreamLengthExceeded { max_length: max_stream_length });
        }

        let ctx = self.ctx.clone();
        let transmission = self.register_send(|id| Ok(SendTransmission::new_stream(id, ctx, data_kind, data_id, max_length)))?;
        debug!("opening stream {} to {:?}: kind {}, id {}", transmission.id(), self.ctx.route, data_kind, data_id);

        transmission.start();
        Ok(StreamSender::new(transmission, self.clone()))
    }

    /// Puts queued genes on the wire as far as the congestion window admits them
    pub fn flush(&self) {
        let now = self.ctx.now();
        while let Some(queued) = self.ctx.flow.pop_sendable() {
            match self.send_transmission(queued.transmission_id) {
                Some(transmission) => transmission.send_queued(queued.serial, now),
                None => trace!("queued gene #{} of unknown transmission {} - skipping", queued.serial, queued.transmission_id),
            }
        }
    }

    /// Handles a datagram received from this connection's route. `datagram` starts with the
    ///  relay header. Returns what the application needs to be told about, if anything.
    #[instrument(skip_all)]
    pub fn on_datagram(&self, datagram: &GeneOwner, now: Mics) -> Option<ReceiveEvent> {
        if self.is_closed() {
            trace!("connection to {:?} is closed - dropping datagram", self.ctx.route);
            return None;
        }

        match self.dispatch_frame(datagram, now) {
            Ok(event) => {
                self.touch(now);
                event
            }
            Err(e) => {
                self.on_protocol_violation(&e);
                None
            }
        }
    }

    fn dispatch_frame(&self, datagram: &GeneOwner, now: Mics) -> Result<Option<ReceiveEvent>, FrameError> {
        let Some(mut frame_buf) = datagram.get(RELAY_HEADER_LEN..) else {
            return Err(FrameError::MissingFrameType);
        };

        match peek_frame_type(frame_buf)? {
            FrameType::FirstGene => {
                let frame = FirstGeneFrame::deser(&mut frame_buf)?;
                let transmission = self.receive_transmission_or_new(frame.transmission_id);
                let result = transmission.on_first_gene(&frame, datagram, RELAY_HEADER_LEN + FirstGeneFrame::LEN, now);
                self.on_gene_result(&transmission, result)
            }
            FrameType::FollowingGene => {
                let frame = FollowingGeneFrame::deser(&mut frame_buf)?;
                let transmission = self.receive_transmission_or_new(frame.transmission_id);
                let result = transmission.on_following_gene(&frame, datagram, RELAY_HEADER_LEN + FollowingGeneFrame::LEN, now);
                self.on_gene_result(&transmission, result)
            }
            FrameType::Ack => {
                let frame = AckFrame::deser(&mut frame_buf)?;
                for record in &frame.records {
                    match self.send_transmission(record.transmission_id) {
                        Some(transmission) => transmission.on_ack(record, now),
                        None => trace!("ack for unknown transmission {} - ignoring", record.transmission_id),
                    }
                }
                self.flush();
                Ok(None)
            }
            FrameType::LostGene => {
                let frame = LostGeneFrame::deser(&mut frame_buf)?;
                match self.send_transmission(frame.transmission_id) {
                    Some(transmission) => transmission.on_lost_gene(&frame, now),
                    None => trace!("lost gene report for unknown transmission {} - ignoring", frame.transmission_id),
                }
                self.flush();
                Ok(None)
            }
            FrameType::Stream => {
                let frame = StreamFrame::deser(&mut frame_buf)?;
                if frame.from_receiver {
                    if let Some(transmission) = self.send_transmission(frame.transmission_id) {
                        transmission.on_stream_frame(&frame);
                    }
                }
                else if let Some(transmission) = self.receive_transmission(frame.transmission_id) {
                    transmission.on_stream_frame(&frame);
                }
                else {
                    trace!("{:?} for unknown transmission - ignoring", frame);
                }
                Ok(None)
            }
        }
    }

    fn on_gene_result(&self, transmission: &ReceiveTransmission, result: Result<GeneReceipt, TransmissionError>) -> Result<Option<ReceiveEvent>, FrameError> {
        match result {
            Ok(receipt) => {
                if receipt.ack_immediately {
                    if let Some(record) = transmission.take_ack() {
                        self.send_ack_records(vec![record]);
                    }
                }
                Ok(receipt.event)
            }
            Err(TransmissionError::MalformedFrame(e)) => {
                transmission.abort(TransmissionError::MalformedFrame(e.clone()), true);
                Err(e)
            }
            Err(e) => {
                // the peer exceeded a limit, which is not a malformed frame
                warn!("transmission {} from {:?} rejected: {}", transmission.id(), self.ctx.route, e);
                transmission.abort(e, true);
                Ok(None)
            }
        }
    }

    fn on_protocol_violation(&self, e: &FrameError) {
        let num_violations = self.protocol_violations.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("protocol violation #{} by {:?}: {}", num_violations, self.ctx.route, e);

        if num_violations > self.ctx.config.max_protocol_violations {
            warn!("closing connection to {:?} after {} protocol violations", self.ctx.route, num_violations);
            self.close();
        }
    }

    pub fn protocol_violations(&self) -> u32 {
        self.protocol_violations.load(Ordering::Acquire)
    }

    /// Sends ack records, packing as many of them into each datagram as fit
    fn send_ack_records(&self, records: Vec<AckRecord>) {
        let max_len = self.ctx.config.max_frame_length - RELAY_HEADER_LEN;

        let mut frame = AckFrame { records: Vec::new() };
        let mut frame_len = AckFrame::HEADER_LEN;
        for record in records {
            let record_len = record.serialized_len();
            if !frame.records.is_empty() && frame_len + record_len > max_len {
                self.ctx.send_control(&frame, frame_len);
                frame.records.clear();
                frame_len = AckFrame::HEADER_LEN;
            }
            frame_len += record_len;
            frame.records.push(record);
        }
        if !frame.records.is_empty() {
            self.ctx.send_control(&frame, frame_len);
        }
    }

    /// Periodic housekeeping: transmission ticks, pending acks, retransmissions and cleanup of
    ///  finished transmissions
    #[instrument(skip_all)]
    pub fn on_tick(&self, now: Mics) {
        if self.is_closed() {
            return;
        }

        let (send, receive) = {
            let transmissions = self.lock_transmissions();
            (
                transmissions.send.values().cloned().collect::<Vec<_>>(),
                transmissions.receive.values().cloned().collect::<Vec<_>>(),
            )
        };

        for transmission in &send {
            transmission.on_tick(now);
        }
        for transmission in &receive {
            transmission.on_tick(now);
        }

        let acks = receive.iter()
            .filter_map(|t| t.take_ack())
            .collect::<Vec<_>>();
        if !acks.is_empty() {
            trace!("sending {} ack records to {:?}", acks.len(), self.ctx.route);
            self.send_ack_records(acks);
        }

        self.flush();
        self.remove_finished(now);
    }

    fn remove_finished(&self, now: Mics) {
        let retention = duration_to_mics(self.ctx.config.completed_retention);

        // dropped outside the lock
        let removed = {
            let mut guard = self.lock_transmissions();
            let transmissions = &mut *guard;

            let mut removed_send = Vec::new();
            transmissions.send.retain(|_, t| {
                if t.is_terminal() {
                    removed_send.push(t.clone());
                    false
                }
                else {
                    true
                }
            });

            for (id, t) in &transmissions.receive {
                if t.is_terminal() {
                    transmissions.receive_terminal_since.entry(*id).or_insert(now);
                }
            }
            let expired = transmissions.receive_terminal_since.iter()
                .filter(|(_, since)| now.saturating_sub(**since) > retention)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            let mut removed_receive = Vec::new();
            for id in expired {
                transmissions.receive_terminal_since.remove(&id);
                removed_receive.extend(transmissions.receive.remove(&id));
            }
            (removed_send, removed_receive)
        };

        if !removed.0.is_empty() || !removed.1.is_empty() {
            trace!("removed {} send and {} receive transmissions for {:?}", removed.0.len(), removed.1.len(), self.ctx.route);
        }
    }

    /// Closes the connection, failing all of its transmissions with `ConnectionClosed`
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing connection to {:?}", self.ctx.route);

        let (send, receive) = {
            let mut transmissions = self.lock_transmissions();
            transmissions.receive_terminal_since.clear();
            (
                transmissions.send.drain().map(|(_, t)| t).collect::<Vec<_>>(),
                transmissions.receive.drain().map(|(_, t)| t).collect::<Vec<_>>(),
            )
        };
        for transmission in send {
            transmission.abort(TransmissionError::ConnectionClosed, true);
        }
        for transmission in receive {
            transmission.abort(TransmissionError::ConnectionClosed, true);
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let transmissions = self.lock_transmissions();
        ConnectionStats {
            flow: self.ctx.flow.stats(),
            send_transmissions: transmissions.send.len(),
            receive_transmissions: transmissions.receive.len(),
            protocol_violations: self.protocol_violations(),
        }
    }
}
