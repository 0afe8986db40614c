use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use bytes::BufMut;
use ed25519_dalek::SigningKey;
use crate::buffers::gene_buf::GeneOwner;
use crate::buffers::gene_pool::GenePool;
use crate::clock::{duration_to_mics, MicsClock};
use crate::config::GeneConfig;
use crate::connection::{Connection, PeerRoute};
use crate::frames::{peek_frame_type, AckFrame, FirstGeneFrame, FollowingGeneFrame, FrameType, LostGeneFrame, StreamFrame, TransmissionControl, WireFrame};
use crate::net_sender::NetSender;
use crate::relay::RELAY_HEADER_LEN;
use crate::transmission::receive_transmission::ReceiveEvent;
use crate::transmission::TransmissionContext;

pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&rand::random::<[u8; 32]>())
}

/// A datagram that was handed to a [CapturingNetSender], with parsing helpers for assertions
#[derive(Debug, Clone)]
pub struct CapturedDatagram {
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

impl CapturedDatagram {
    fn frame(&self) -> &[u8] {
        &self.data[RELAY_HEADER_LEN..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn relay_id(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    pub fn frame_type(&self) -> FrameType {
        peek_frame_type(self.frame()).unwrap()
    }

    pub fn first_gene(&self) -> FirstGeneFrame {
        FirstGeneFrame::deser(&mut self.frame()).unwrap()
    }

    pub fn following_gene(&self) -> FollowingGeneFrame {
        FollowingGeneFrame::deser(&mut self.frame()).unwrap()
    }

    /// The gene serial for gene frames, `None` for all other frames
    pub fn gene_serial(&self) -> Option<u32> {
        match self.frame_type() {
            FrameType::FirstGene => Some(0),
            FrameType::FollowingGene => Some(self.following_gene().data_position),
            _ => None,
        }
    }

    pub fn control(&self) -> TransmissionControl {
        match self.frame_type() {
            FrameType::FirstGene => self.first_gene().control,
            _ => self.following_gene().control,
        }
    }

    /// A gene's payload
    pub fn payload(&self) -> &[u8] {
        match self.frame_type() {
            FrameType::FirstGene => &self.frame()[FirstGeneFrame::LEN..],
            _ => &self.frame()[FollowingGeneFrame::LEN..],
        }
    }

    pub fn ack(&self) -> AckFrame {
        AckFrame::deser(&mut self.frame()).unwrap()
    }

    pub fn lost_gene(&self) -> LostGeneFrame {
        LostGeneFrame::deser(&mut self.frame()).unwrap()
    }

    pub fn stream_frame(&self) -> StreamFrame {
        StreamFrame::deser(&mut self.frame()).unwrap()
    }
}

/// An in-memory network: datagrams are captured rather than sent
#[derive(Default)]
pub struct CapturingNetSender {
    sent: Mutex<Vec<CapturedDatagram>>,
}

impl CapturingNetSender {
    /// All datagrams sent since the last call
    pub fn take(&self) -> Vec<CapturedDatagram> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn peek(&self) -> Vec<CapturedDatagram> {
        self.sent.lock().unwrap().clone()
    }
}

impl NetSender for CapturingNetSender {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        self.sent.lock().unwrap().push(CapturedDatagram {
            to,
            data: datagram.to_vec(),
        });
    }
}

pub fn test_context(config: GeneConfig) -> (Arc<TransmissionContext>, Arc<CapturingNetSender>) {
    let net = Arc::new(CapturingNetSender::default());
    let pool = Arc::new(GenePool::new(config.max_frame_length, config.buffer_pool_size));
    let ctx = TransmissionContext::new(
        PeerRoute::direct(test_addr(9000)),
        Arc::new(config),
        MicsClock::new(),
        pool,
        net.clone(),
    );
    (Arc::new(ctx), net)
}

pub fn test_connection(config: GeneConfig) -> (Arc<Connection>, Arc<CapturingNetSender>) {
    let (ctx, net) = test_context(config);
    (Arc::new(Connection::new(ctx)), net)
}

/// Copies raw bytes into a pooled buffer, as the receive loop does
pub fn to_datagram(pool: &Arc<GenePool>, raw: &[u8]) -> GeneOwner {
    let mut buf = pool.rent(raw.len());
    buf.put_slice(raw);
    buf.freeze()
}

/// Passes datagrams back and forth between two connections until there is no more traffic,
///  ticking both connections while the network is idle. Datagrams from `a` to `b` for which
///  `drop_filter` returns `true` are lost. Returns the events at `b`.
pub fn pump(
    a: &Connection,
    a_net: &CapturingNetSender,
    b: &Connection,
    b_net: &CapturingNetSender,
    mut drop_filter: impl FnMut(&CapturedDatagram) -> bool,
) -> Vec<ReceiveEvent> {
    const MAX_ROUNDS: usize = 10_000;
    const IDLE_TICKS: usize = 3;

    let tick = duration_to_mics(a.context().config.tick_interval);
    let mut now = a.context().now();
    let mut events = Vec::new();
    let mut idle_ticks = 0;

    for _ in 0..MAX_ROUNDS {
        now = now.max(a.context().now());

        let a_to_b = a_net.take();
        let b_to_a = b_net.take();
        if a_to_b.is_empty() && b_to_a.is_empty() {
            if idle_ticks >= IDLE_TICKS {
                return events;
            }
            idle_ticks += 1;
            now += tick;
            a.on_tick(now);
            b.on_tick(now);
            continue;
        }
        idle_ticks = 0;

        for d in a_to_b {
            if drop_filter(&d) {
                continue;
            }
            events.extend(b.on_datagram(&to_datagram(&b.context().pool, &d.data), now));
        }
        for d in b_to_a {
            // events at `a` are not expected
            drop(a.on_datagram(&to_datagram(&a.context().pool, &d.data), now));
        }
    }
    panic!("traffic did not settle after {} rounds", MAX_ROUNDS);
}
