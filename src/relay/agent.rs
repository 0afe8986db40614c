use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};
use crate::clock::{duration_to_mics, Mics};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::certificate::{RelayAuthorizer, RelayCertificate};
use crate::relay::resolver::{NodeId, NodeResolver};
use crate::relay::DIRECT;

/// Attempts to find a free pair of random relay ids before giving up
const MAX_ID_ATTEMPTS: usize = 64;

/// A request to relay between the requesting connection and a target node
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub requester: SocketAddr,
    /// salt of the requesting connection, the certificate must be issued for it
    pub connection_salt: u64,
    pub target: NodeId,
    pub certificate: RelayCertificate,
    /// The relay id to use towards the target. This is set when chaining relays, where the
    ///  next hop already allocated the id it expects; a random id is allocated otherwise.
    pub outer_relay_id: Option<u16>,
}

/// Ids of a new relay mapping: the requester sends with `relay_id`, the target sees
///  `outer_relay_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayGrant {
    pub relay_id: u16,
    pub outer_relay_id: u16,
}

/// Where to send a forwarded datagram, and with which relay id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardTarget {
    pub to: SocketAddr,
    pub relay_id: u16,
}

#[derive(Debug)]
struct RelayEntry {
    relay_id: u16,
    outer_relay_id: u16,
    requester: SocketAddr,
    target: SocketAddr,
    points: u64,
    last_used: Mics,
}

#[derive(Default)]
struct RelayDirectory {
    /// keyed by the requester side's relay id
    entries: FxHashMap<u16, RelayEntry>,
    /// target side relay id -> requester side relay id
    outer_index: FxHashMap<u16, u16>,
    per_requester: FxHashMap<SocketAddr, usize>,
}

impl RelayDirectory {
    fn is_used(&self, id: u16) -> bool {
        id == DIRECT || self.entries.contains_key(&id) || self.outer_index.contains_key(&id)
    }

    fn key_for(&self, id: u16) -> Option<u16> {
        if self.entries.contains_key(&id) {
            Some(id)
        }
        else {
            self.outer_index.get(&id).copied()
        }
    }

    fn remove(&mut self, key: u16) -> Option<RelayEntry> {
        let entry = self.entries.remove(&key)?;
        self.outer_index.remove(&entry.outer_relay_id);
        if let Some(count) = self.per_requester.get_mut(&entry.requester) {
            *count -= 1;
            if *count == 0 {
                self.per_requester.remove(&entry.requester);
            }
        }
        Some(entry)
    }

    fn check_capacity(&self, requester: &SocketAddr, config: &RelayConfig) -> Result<(), RelayError> {
        let for_requester = self.per_requester.get(requester).copied().unwrap_or(0);
        if for_requester >= config.max_relay_exchanges {
            debug!("{:?} already has {} relays", requester, for_requester);
            return Err(RelayError::CapacityExceeded);
        }
        if self.entries.len() >= config.max_parallel_relays {
            debug!("relay agent is at its limit of {} relays", config.max_parallel_relays);
            return Err(RelayError::CapacityExceeded);
        }
        Ok(())
    }

    fn allocate_id(&self) -> Option<u16> {
        (0..MAX_ID_ATTEMPTS)
            .map(|_| rand::random::<u16>())
            .find(|&id| !self.is_used(id))
    }
}

/// The relay side of relaying: a directory of relay mappings, each with a budget of points
///  that forwarding consumes.
pub struct RelayAgent {
    config: RelayConfig,
    authorizer: RelayAuthorizer,
    resolver: Arc<dyn NodeResolver>,
    directory: Mutex<RelayDirectory>,
}

impl RelayAgent {
    pub fn new(config: RelayConfig, authorizer: RelayAuthorizer, resolver: Arc<dyn NodeResolver>) -> RelayAgent {
        RelayAgent {
            config,
            authorizer,
            resolver,
            directory: Default::default(),
        }
    }

    fn lock_directory(&self) -> MutexGuard<'_, RelayDirectory> {
        self.directory.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a relay mapping. Nothing is allocated unless the certificate is valid for the
    ///  requesting connection.
    pub async fn add(&self, request: &RelayRequest, now: Mics) -> Result<RelayGrant, RelayError> {
        self.authorizer.verify(&request.certificate, request.connection_salt, request.target)?;
        self.lock_directory().check_capacity(&request.requester, &self.config)?;

        let target = self.resolver.resolve(request.target).await?;

        let mut directory = self.lock_directory();
        // resolving may have taken a while
        directory.check_capacity(&request.requester, &self.config)?;

        let relay_id = directory.allocate_id()
            .ok_or(RelayError::CapacityExceeded)?;
        let outer_relay_id = match request.outer_relay_id {
            Some(id) if directory.is_used(id) || id == relay_id => {
                debug!("requested outer relay id {} is in use", id);
                return Err(RelayError::CapacityExceeded);
            }
            Some(id) => id,
            None => loop {
                let id = directory.allocate_id()
                    .ok_or(RelayError::CapacityExceeded)?;
                if id != relay_id {
                    break id;
                }
            },
        };

        directory.entries.insert(relay_id, RelayEntry {
            relay_id,
            outer_relay_id,
            requester: request.requester,
            target,
            points: self.config.initial_points,
            last_used: now,
        });
        directory.outer_index.insert(outer_relay_id, relay_id);
        *directory.per_requester.entry(request.requester).or_default() += 1;

        info!("relay {} / {} created between {:?} and {} at {:?}", relay_id, outer_relay_id, request.requester, request.target, target);
        Ok(RelayGrant { relay_id, outer_relay_id })
    }

    /// Credits points to a relay mapping, identified by either of its ids. Returns the new
    ///  balance.
    pub fn add_relay_point(&self, relay_id: u16, points: u64) -> Result<u64, RelayError> {
        let mut directory = self.lock_directory();
        let key = directory.key_for(relay_id)
            .ok_or(RelayError::UnknownRelay(relay_id))?;
        let entry = directory.entries.get_mut(&key)
            .ok_or(RelayError::UnknownRelay(relay_id))?;
        entry.points = entry.points.saturating_add(points);
        trace!("relay {}: credited {} points, balance {}", relay_id, points, entry.points);
        Ok(entry.points)
    }

    /// Checks whether a datagram that arrived with `relay_id` from `from` is to be forwarded,
    ///  and debits the forwarding cost.
    ///
    /// `UnknownRelay` and `EndpointMismatch` mean that the datagram is not relay traffic for
    ///  this node. All other failures are refusals.
    pub fn forward(&self, from: SocketAddr, relay_id: u16, now: Mics) -> Result<ForwardTarget, RelayError> {
        let mut directory = self.lock_directory();
        let key = directory.key_for(relay_id)
            .ok_or(RelayError::UnknownRelay(relay_id))?;

        let retention = duration_to_mics(self.config.retention);
        let expired = directory.entries.get(&key)
            .map(|e| now.saturating_sub(e.last_used) > retention)
            .unwrap_or(false);
        if expired {
            directory.remove(key);
            debug!("relay {} expired", relay_id);
            return Err(RelayError::Expired(relay_id));
        }

        let entry = directory.entries.get_mut(&key)
            .ok_or(RelayError::UnknownRelay(relay_id))?;

        let target = if relay_id == entry.relay_id && from == entry.requester {
            ForwardTarget { to: entry.target, relay_id: entry.outer_relay_id }
        }
        else if relay_id == entry.outer_relay_id && from == entry.target {
            ForwardTarget { to: entry.requester, relay_id: entry.relay_id }
        }
        else {
            return Err(RelayError::EndpointMismatch { relay_id, from });
        };

        if entry.points < self.config.forward_cost {
            return Err(RelayError::PointsExhausted(relay_id));
        }
        entry.points -= self.config.forward_cost;
        entry.last_used = now;

        trace!("relay {}: forwarding to {:?} as {}, {} points left", relay_id, target.to, target.relay_id, entry.points);
        Ok(target)
    }

    /// Removes all mappings that were inactive for longer than the retention period. Returns
    ///  the number of removed mappings.
    pub fn sweep(&self, now: Mics) -> usize {
        let retention = duration_to_mics(self.config.retention);
        let mut directory = self.lock_directory();

        let expired = directory.entries.values()
            .filter(|e| now.saturating_sub(e.last_used) > retention)
            .map(|e| e.relay_id)
            .collect::<Vec<_>>();
        for key in &expired {
            directory.remove(*key);
        }
        if !expired.is_empty() {
            debug!("removed {} expired relays", expired.len());
        }
        expired.len()
    }

    /// Tears down a mapping, identified by either of its ids
    pub fn remove(&self, relay_id: u16) -> bool {
        let mut directory = self.lock_directory();
        match directory.key_for(relay_id) {
            Some(key) => directory.remove(key).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_directory().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
