use std::net::SocketAddr;
use tracing::debug;
use crate::connection::PeerRoute;
use crate::error::RelayError;
use crate::relay::agent::RelayGrant;
use crate::relay::resolver::NodeId;

/// One relay node on the way to a target, with the ids it granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHop {
    pub relay_addr: SocketAddr,
    pub grant: RelayGrant,
}

/// The client side of relaying: an ordered chain of relay hops towards a target node.
///
/// Circuits are built from the target backwards. Each new hop is prepended, and its outer
///  relay id must be the id the previous first hop granted, so that forwarded datagrams arrive
///  with an id the next relay knows.
#[derive(Debug, Clone)]
pub struct RelayCircuit {
    target: NodeId,
    target_addr: SocketAddr,
    /// first hop first
    hops: Vec<RelayHop>,
    max_serial_relays: usize,
}

impl RelayCircuit {
    pub fn new(target: NodeId, target_addr: SocketAddr, max_serial_relays: usize) -> RelayCircuit {
        RelayCircuit {
            target,
            target_addr,
            hops: Vec::new(),
            max_serial_relays,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// The id a new first hop must use towards the current first hop, if there is one
    pub fn next_outer_relay_id(&self) -> Option<u16> {
        self.hops.first()
            .map(|hop| hop.grant.relay_id)
    }

    pub fn prepend(&mut self, hop: RelayHop) -> Result<(), RelayError> {
        if self.hops.len() >= self.max_serial_relays {
            debug!("circuit to {} already has {} relays", self.target, self.hops.len());
            return Err(RelayError::SerialLimitExceeded(self.max_serial_relays));
        }
        if let Some(expected) = self.next_outer_relay_id() {
            if hop.grant.outer_relay_id != expected {
                debug!("relay hop {:?} does not chain to relay id {}", hop, expected);
                return Err(RelayError::UnknownRelay(hop.grant.outer_relay_id));
            }
        }
        self.hops.insert(0, hop);
        Ok(())
    }

    pub fn hops(&self) -> &[RelayHop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Where to send datagrams for the target
    pub fn route(&self) -> PeerRoute {
        match self.hops.first() {
            Some(hop) => PeerRoute::relayed(hop.relay_addr, hop.grant.relay_id),
            None => PeerRoute::direct(self.target_addr),
        }
    }
}
