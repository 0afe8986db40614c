//! Transmissions are the logical messages of a connection: a *block* of known size or an
//!  open-ended *stream*. Sending and receiving sides are separate types, each guarding its gene
//!  window with its own lock.

pub mod receive_transmission;
pub mod send_transmission;
pub mod state;
pub mod stream;

use std::sync::Arc;
use bytes::BufMut;
use tracing::trace;
use crate::buffers::gene_buf::GeneBufMut;
use crate::buffers::gene_pool::GenePool;
use crate::clock::{Mics, MicsClock};
use crate::config::GeneConfig;
use crate::connection::PeerRoute;
use crate::flow::flow_control::FlowControl;
use crate::frames::WireFrame;
use crate::net_sender::NetSender;
use crate::relay::RELAY_HEADER_LEN;

/// Everything a transmission needs from its connection. One instance is shared by all
///  transmissions to the same peer.
pub struct TransmissionContext {
    pub route: PeerRoute,
    pub config: Arc<GeneConfig>,
    pub clock: MicsClock,
    pub pool: Arc<GenePool>,
    pub flow: FlowControl,
    pub net_sender: Arc<dyn NetSender>,
}

impl TransmissionContext {
    pub fn new(route: PeerRoute, config: Arc<GeneConfig>, clock: MicsClock, pool: Arc<GenePool>, net_sender: Arc<dyn NetSender>) -> TransmissionContext {
        let flow = FlowControl::new(&config);
        TransmissionContext {
            route,
            config,
            clock,
            pool,
            flow,
            net_sender,
        }
    }

    pub fn now(&self) -> Mics {
        self.clock.now_mics()
    }

    /// A pooled buffer with the relay header already written
    pub fn rent_datagram(&self, frame_len: usize) -> GeneBufMut {
        let mut buf = self.pool.rent(RELAY_HEADER_LEN + frame_len);
        buf.put_u16_le(self.route.relay_id);
        buf
    }

    /// Sends a control frame right away. Control frames are small, never retransmitted by the
    ///  engine and do not count against the congestion window.
    pub fn send_control<F: WireFrame + std::fmt::Debug>(&self, frame: &F, frame_len: usize) {
        trace!("sending {:?} to {:?}", frame, self.route);
        let mut buf = self.rent_datagram(frame_len);
        frame.ser(&mut buf);
        self.net_sender.send_datagram(self.route.addr, buf.as_ref());
    }
}
