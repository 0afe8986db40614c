use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use bytes::{BufMut, Bytes};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::buffers::gene_buf::GeneOwner;
use crate::buffers::gene_pool::{GenePool, PoolDump};
use crate::clock::{duration_to_mics, MicsClock};
use crate::config::GeneConfig;
use crate::connection::{Connection, PeerRoute};
use crate::dispatcher::{GeneDispatcher, Payload};
use crate::error::{RelayError, TransmissionError};
use crate::net_sender::NetSender;
use crate::relay::agent::{ForwardTarget, RelayAgent, RelayGrant, RelayRequest};
use crate::relay::certificate::RelayCertificate;
use crate::relay::resolver::NodeId;
use crate::relay::{read_relay_id, write_relay_id, DIRECT};
use crate::transmission::receive_transmission::ReceiveEvent;
use crate::transmission::send_transmission::SendTransmission;
use crate::transmission::stream::StreamSender;
use crate::transmission::TransmissionContext;

/// EndPoint is the place where all other parts of the engine come together: It listens on a
///  UdpSocket, dispatching incoming datagrams to their connections or forwarding them as a
///  relay, drives all connections' timers, and has an API for application code to send blocks
///  and streams.
pub struct EndPoint {
    config: Arc<GeneConfig>,
    socket: Arc<UdpSocket>,
    net_sender: Arc<dyn NetSender>,
    clock: MicsClock,
    pool: Arc<GenePool>,
    dispatcher: Arc<dyn GeneDispatcher>,
    relay_agent: Option<Arc<RelayAgent>>,
    connections: Mutex<FxHashMap<PeerRoute, Arc<Connection>>>,
}

impl EndPoint {
    pub async fn bind(
        self_addr: SocketAddr,
        config: GeneConfig,
        dispatcher: Arc<dyn GeneDispatcher>,
        relay_agent: Option<Arc<RelayAgent>>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        //TODO set the "don't fragment" flag
        let socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound socket to {:?}", socket.local_addr()?);
        if relay_agent.is_some() {
            info!("relaying is enabled");
        }

        let pool = Arc::new(GenePool::new(config.max_frame_length, config.buffer_pool_size));
        Ok(Arc::new(EndPoint {
            config: Arc::new(config),
            net_sender: socket.clone(),
            socket,
            clock: MicsClock::new(),
            pool,
            dispatcher,
            relay_agent,
            connections: Default::default(),
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn relay_agent(&self) -> Option<&Arc<RelayAgent>> {
        self.relay_agent.as_ref()
    }

    pub fn pool_dump(&self) -> PoolDump {
        self.pool.dump()
    }

    /// Spawns the receive loop and the timer loop
    pub fn spawn(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let recv = tokio::spawn(self.clone().recv_loop());
        let timer = tokio::spawn(self.clone().timer_loop());
        (recv, timer)
    }

    fn lock_connections(&self) -> MutexGuard<'_, FxHashMap<PeerRoute, Arc<Connection>>> {
        self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The connection for a route, created on first use
    pub fn connection(&self, route: PeerRoute) -> Arc<Connection> {
        let mut connections = self.lock_connections();
        let connection = connections
            .entry(route)
            .or_insert_with(|| {
                debug!("initializing connection to {:?}", route);
                let ctx = TransmissionContext::new(route, self.config.clone(), self.clock, self.pool.clone(), self.net_sender.clone());
                Arc::new(Connection::new(Arc::new(ctx)))
            })
            .clone();
        // while holding the lock, so the connection is not evicted before it is used
        connection.touch(self.clock.now_mics());
        connection
    }

    /// The connection a received datagram belongs to. A datagram from a route without a
    ///  connection opens one only if it starts a transmission.
    fn connection_for_datagram(&self, route: PeerRoute, datagram: &[u8]) -> Option<Arc<Connection>> {
        if let Some(connection) = self.lock_connections().get(&route) {
            return Some(connection.clone());
        }
        if Connection::is_opening_datagram(datagram) {
            Some(self.connection(route))
        }
        else {
            debug!("datagram from {:?} does not open a connection - dropping", route);
            None
        }
    }

    pub fn send_block(&self, to: PeerRoute, data_kind: u32, data_id: u64, payload: impl Into<Bytes>) -> Result<Arc<SendTransmission>, TransmissionError> {
        self.connection(to)
            .send_block(data_kind, data_id, payload.into())
    }

    /// Serializes a value and sends it as a block with the value type's data kind
    pub fn send_value<T: Payload>(&self, to: PeerRoute, data_id: u64, value: &T) -> Result<Arc<SendTransmission>, TransmissionError> {
        self.send_block(to, T::DATA_KIND, data_id, value.to_bytes())
    }

    pub fn open_stream(&self, to: PeerRoute, data_kind: u32, data_id: u64, max_length: u32) -> Result<StreamSender, TransmissionError> {
        self.connection(to)
            .open_stream(data_kind, data_id, max_length)
    }

    /// Creates a relay mapping on this node for a peer that talks to it directly. The
    ///  certificate must be issued for the salt of this node's connection to the requester.
    pub async fn add_relay(&self, requester: SocketAddr, target: NodeId, certificate: RelayCertificate, outer_relay_id: Option<u16>) -> Result<RelayGrant, RelayError> {
        let Some(agent) = &self.relay_agent else {
            debug!("relay requested by {:?}, but this node does not relay", requester);
            return Err(RelayError::CapacityExceeded);
        };

        let request = RelayRequest {
            requester,
            connection_salt: self.connection(PeerRoute::direct(requester)).salt(),
            target,
            certificate,
            outer_relay_id,
        };
        agent.add(&request, self.clock.now_mics()).await
    }

    pub async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        loop {
            let mut buf = self.pool.rent(self.config.max_frame_length);
            let (num_read, from) = match self.socket.recv_from(buf.as_full_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            buf.set_filled(num_read);

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            self.on_datagram(from, buf.freeze())
                .instrument(span)
                .await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: GeneOwner) {
        trace!("received datagram from {:?}: {:?}", from, datagram.as_ref());

        let Some(relay_id) = read_relay_id(&datagram) else {
            debug!("datagram from {:?} is too short for the relay header - dropping", from);
            return;
        };

        if relay_id != DIRECT {
            if let Some(agent) = &self.relay_agent {
                match agent.forward(from, relay_id, self.clock.now_mics()) {
                    Ok(target) => {
                        self.forward(&datagram, target);
                        return;
                    }
                    // not relay traffic for this node, but a peer talking to us through a relay
                    Err(RelayError::UnknownRelay(_)) | Err(RelayError::EndpointMismatch { .. }) => {}
                    Err(e) => {
                        warn!("refusing to forward datagram from {:?} with relay id {}: {}", from, relay_id, e);
                        return;
                    }
                }
            }
        }

        let route = PeerRoute { addr: from, relay_id };
        let Some(connection) = self.connection_for_datagram(route, &datagram) else {
            return;
        };
        let event = connection.on_datagram(&datagram, self.clock.now_mics());
        drop(datagram);

        match event {
            Some(ReceiveEvent::Block { data_kind, data_id, payload }) => {
                self.dispatcher.on_block(route, data_kind, data_id, payload).await;
            }
            Some(ReceiveEvent::Stream { data_kind, data_id, receiver }) => {
                self.dispatcher.on_stream(route, data_kind, data_id, receiver).await;
            }
            None => {}
        }
    }

    /// Forwards a copy of the datagram with the relay id rewritten. The received buffer may be
    ///  shared, so it is never modified in place.
    fn forward(&self, datagram: &GeneOwner, target: ForwardTarget) {
        let mut buf = self.pool.rent(datagram.len());
        buf.put_slice(datagram);
        write_relay_id(buf.as_mut(), target.relay_id);

        trace!("forwarding {} bytes to {:?} as relay id {}", buf.len(), target.to, target.relay_id);
        self.net_sender.send_datagram(target.to, buf.as_ref());
    }

    pub async fn timer_loop(self: Arc<Self>) {
        info!("starting timer loop");

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.on_tick();
        }
    }

    fn on_tick(&self) {
        let now = self.clock.now_mics();

        let connections = self.lock_connections()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for connection in &connections {
            connection.on_tick(now);
        }

        let idle_timeout = duration_to_mics(self.config.completed_retention);
        let removed = {
            let mut map = self.lock_connections();
            let before = map.len();
            map.retain(|_, c| !c.is_closed() && !c.is_idle(now, idle_timeout));
            before - map.len()
        };
        if removed > 0 {
            debug!("removed {} closed or idle connections", removed);
        }

        if let Some(agent) = &self.relay_agent {
            agent.sweep(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use crate::config::RelayConfig;
    use crate::frames::{FollowingGeneFrame, TransmissionControl, WireFrame};
    use crate::relay::RELAY_HEADER_LEN;
    use crate::relay::certificate::RelayAuthorizer;
    use crate::relay::circuit::{RelayCircuit, RelayHop};
    use crate::relay::resolver::StaticNodeResolver;
    use crate::test_util::signing_key;
    use crate::transmission::stream::StreamReceiver;

    type Received = (PeerRoute, u32, u64, Bytes);

    struct ChannelDispatcher {
        blocks: mpsc::UnboundedSender<Received>,
    }

    #[async_trait]
    impl GeneDispatcher for ChannelDispatcher {
        async fn on_block(&self, from: PeerRoute, data_kind: u32, data_id: u64, payload: Bytes) {
            let _ = self.blocks.send((from, data_kind, data_id, payload));
        }

        async fn on_stream(&self, from: PeerRoute, data_kind: u32, data_id: u64, mut receiver: StreamReceiver) {
            let blocks = self.blocks.clone();
            tokio::spawn(async move {
                if let Ok(data) = receiver.read_to_end().await {
                    let _ = blocks.send((from, data_kind, data_id, data));
                }
            });
        }
    }

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn end_point(config: GeneConfig, relay_agent: Option<Arc<RelayAgent>>) -> (Arc<EndPoint>, mpsc::UnboundedReceiver<Received>) {
        let (blocks, received) = mpsc::unbounded_channel();
        let end_point = EndPoint::bind(localhost(), config, Arc::new(ChannelDispatcher { blocks }), relay_agent).await.unwrap();
        end_point.spawn();
        (end_point, received)
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
    }

    #[tokio::test]
    async fn test_block_between_end_points() {
        let (a, _) = end_point(GeneConfig::default_ipv4(), None).await;
        let (b, mut b_received) = end_point(GeneConfig::default_ipv4(), None).await;

        let sent = payload(100_000);
        let t = a.send_block(PeerRoute::direct(b.local_addr().unwrap()), 7, 8, sent.clone()).unwrap();
        timeout(Duration::from_secs(5), t.wait()).await.unwrap().unwrap();

        let (from, data_kind, data_id, received) = timeout(Duration::from_secs(5), b_received.recv()).await.unwrap().unwrap();
        assert_eq!(from, PeerRoute::direct(a.local_addr().unwrap()));
        assert_eq!((data_kind, data_id), (7, 8));
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_stream_between_end_points() {
        let (a, _) = end_point(GeneConfig::default_ipv4(), None).await;
        let (b, mut b_received) = end_point(GeneConfig::default_ipv4(), None).await;

        let sender = a.open_stream(PeerRoute::direct(b.local_addr().unwrap()), 1, 2, 1_000_000).unwrap();
        for _ in 0..10 {
            sender.write(payload(3000)).unwrap();
        }
        timeout(Duration::from_secs(5), sender.finish()).await.unwrap().unwrap();

        let (_, _, _, received) = timeout(Duration::from_secs(5), b_received.recv()).await.unwrap().unwrap();
        assert_eq!(received.len(), 30_000);
        assert_eq!(&received[3000..6000], payload(3000).as_ref());
    }

    #[tokio::test]
    async fn test_send_value() {
        struct Greeting(String);

        impl Payload for Greeting {
            const DATA_KIND: u32 = 99;

            fn ser(&self, buf: &mut bytes::BytesMut) {
                buf.put_slice(self.0.as_bytes());
            }

            fn deser(buf: &[u8]) -> anyhow::Result<Self> {
                Ok(Greeting(String::from_utf8(buf.to_vec())?))
            }
        }

        let (a, _) = end_point(GeneConfig::default_ipv4(), None).await;
        let (b, mut b_received) = end_point(GeneConfig::default_ipv4(), None).await;

        a.send_value(PeerRoute::direct(b.local_addr().unwrap()), 1, &Greeting("hello".to_string())).unwrap();
        let (_, data_kind, _, received) = timeout(Duration::from_secs(5), b_received.recv()).await.unwrap().unwrap();
        assert_eq!(data_kind, Greeting::DATA_KIND);
        assert_eq!(Greeting::decode(&received).unwrap().0, "hello");
    }

    async fn relay_setup(initial_points: u64) -> (Arc<EndPoint>, Arc<EndPoint>, Arc<EndPoint>, mpsc::UnboundedReceiver<Received>, RelayCircuit) {
        let issuer = signing_key();
        let (b, b_received) = end_point(GeneConfig::default_ipv4(), None).await;
        let b_addr = b.local_addr().unwrap();

        let agent = RelayAgent::new(
            RelayConfig { initial_points, ..RelayConfig::default() },
            RelayAuthorizer::new(issuer.verifying_key()),
            Arc::new(StaticNodeResolver::new([(NodeId(2), b_addr)])),
        );
        let (relay, _) = end_point(GeneConfig::default_ipv4(), Some(Arc::new(agent))).await;
        let (a, _) = end_point(GeneConfig::default_ipv4(), None).await;

        let a_addr = a.local_addr().unwrap();
        let salt = relay.connection(PeerRoute::direct(a_addr)).salt();
        let certificate = RelayCertificate::sign(&issuer, salt, NodeId(2));
        let grant = relay.add_relay(a_addr, NodeId(2), certificate, None).await.unwrap();

        let mut circuit = RelayCircuit::new(NodeId(2), b_addr, 3);
        circuit.prepend(RelayHop { relay_addr: relay.local_addr().unwrap(), grant }).unwrap();
        (a, relay, b, b_received, circuit)
    }

    #[tokio::test]
    async fn test_block_through_relay() {
        let (a, relay, _b, mut b_received, circuit) = relay_setup(10_000).await;
        let grant = circuit.hops()[0].grant;

        let sent = payload(20_000);
        let t = a.send_block(circuit.route(), 3, 4, sent.clone()).unwrap();
        timeout(Duration::from_secs(5), t.wait()).await.unwrap().unwrap();

        let (from, _, _, received) = timeout(Duration::from_secs(5), b_received.recv()).await.unwrap().unwrap();
        assert_eq!(from, PeerRoute::relayed(relay.local_addr().unwrap(), grant.outer_relay_id));
        assert_eq!(received, sent);

        let remaining = relay.relay_agent().unwrap().add_relay_point(grant.relay_id, 0).unwrap();
        assert!(remaining < 10_000);
    }

    #[tokio::test]
    async fn test_relay_without_points_refuses() {
        let (a, _relay, _b, mut b_received, circuit) = relay_setup(0).await;

        a.send_block(circuit.route(), 3, 4, payload(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b_received.try_recv().is_err());
    }

    async fn unspawned_end_point(config: GeneConfig) -> Arc<EndPoint> {
        let (blocks, _) = mpsc::unbounded_channel();
        EndPoint::bind(localhost(), config, Arc::new(ChannelDispatcher { blocks }), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_junk_does_not_create_connections() {
        let end_point = unspawned_end_point(GeneConfig::default_ipv4()).await;
        let from = SocketAddr::from(([127, 0, 0, 1], 5555));

        for relay_id in 1..=2000u16 {
            let mut junk = relay_id.to_le_bytes().to_vec();
            junk.push(0);
            end_point.on_datagram(from, crate::test_util::to_datagram(&end_point.pool, &junk)).await;
        }
        assert_eq!(end_point.lock_connections().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_are_evicted() {
        let mut config = GeneConfig::default_ipv4();
        config.transmission_timeout = Duration::from_millis(100);
        config.completed_retention = Duration::from_millis(50);
        let end_point = unspawned_end_point(config).await;
        let from = SocketAddr::from(([127, 0, 0, 1], 5555));

        // following genes without a first gene open a transmission that never completes
        for relay_id in 1..=20u16 {
            let frame = FollowingGeneFrame { transmission_id: 1, control: TransmissionControl::empty(), data_position: 1 };
            let mut buf = end_point.pool.rent(RELAY_HEADER_LEN + FollowingGeneFrame::LEN);
            buf.put_u16_le(relay_id);
            frame.ser(&mut buf);
            end_point.on_datagram(from, buf.freeze()).await;
        }
        assert_eq!(end_point.lock_connections().len(), 20);

        let sending_route = PeerRoute::direct(SocketAddr::from(([127, 0, 0, 1], 5556)));
        let _stream = end_point.open_stream(sending_route, 0, 0, 1000).unwrap();

        // connections with live transmissions are kept beyond the idle timeout
        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(10)).await;
            end_point.on_tick();
        }
        assert_eq!(end_point.lock_connections().len(), 21);

        // transmissions time out, and their connections are evicted after being idle
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(10)).await;
            end_point.on_tick();
        }
        assert_eq!(end_point.lock_connections().len(), 0);
    }

    #[tokio::test]
    async fn test_add_relay_with_wrong_salt() {
        let issuer = signing_key();
        let agent = RelayAgent::new(
            RelayConfig::default(),
            RelayAuthorizer::new(issuer.verifying_key()),
            Arc::new(StaticNodeResolver::default()),
        );
        let (relay, _) = end_point(GeneConfig::default_ipv4(), Some(Arc::new(agent))).await;

        let requester = SocketAddr::from(([127, 0, 0, 1], 4711));
        let salt = relay.connection(PeerRoute::direct(requester)).salt();
        let certificate = RelayCertificate::sign(&issuer, salt.wrapping_add(1), NodeId(2));
        assert_eq!(relay.add_relay(requester, NodeId(2), certificate, None).await, Err(RelayError::NotAuthenticated));
    }
}
