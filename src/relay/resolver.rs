use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::RwLock;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use crate::error::RelayError;

/// Logical identifier of a node, independent of its current network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{:016x}", self.0)
    }
}

/// Turns node ids into network addresses. Discovery is outside the engine's scope, the engine
///  only consumes the result.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeResolver: Send + Sync + 'static {
    async fn resolve(&self, node: NodeId) -> Result<SocketAddr, RelayError>;
}

/// A resolver backed by an explicitly maintained table
#[derive(Default)]
pub struct StaticNodeResolver {
    nodes: RwLock<FxHashMap<NodeId, SocketAddr>>,
}

impl StaticNodeResolver {
    pub fn new(nodes: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> StaticNodeResolver {
        StaticNodeResolver {
            nodes: RwLock::new(nodes.into_iter().collect()),
        }
    }

    pub fn insert(&self, node: NodeId, addr: SocketAddr) {
        self.nodes.write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(node, addr);
    }
}

#[async_trait]
impl NodeResolver for StaticNodeResolver {
    async fn resolve(&self, node: NodeId) -> Result<SocketAddr, RelayError> {
        self.nodes.read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&node)
            .copied()
            .ok_or_else(|| RelayError::ResolutionFailed(node.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let addr = SocketAddr::from(([1, 2, 3, 4], 5));
        let resolver = StaticNodeResolver::new([(NodeId(1), addr)]);
        assert_eq!(resolver.resolve(NodeId(1)).await, Ok(addr));
        assert_eq!(resolver.resolve(NodeId(2)).await, Err(RelayError::ResolutionFailed("node:0000000000000002".to_string())));

        resolver.insert(NodeId(2), addr);
        assert_eq!(resolver.resolve(NodeId(2)).await, Ok(addr));
    }
}
