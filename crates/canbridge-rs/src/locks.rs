// crates/canbridge-rs/src/locks.rs

//! Write-lock bookkeeping: at most one client may mutate a given node.

use crate::types::NodeId;
use log::debug;
use std::collections::BTreeMap;

pub type ClientId = u32;

/// Node ownership table, maintained as a pair of exact inverse maps.
#[derive(Debug, Default)]
pub struct ClientLockManager {
    by_node: BTreeMap<NodeId, ClientId>,
    by_client: BTreeMap<ClientId, NodeId>,
}

impl ClientLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `client` the lock on `node`. Succeeds when the node is free
    /// or already held by this client.
    pub fn acquire(&mut self, node: NodeId, client: ClientId) -> bool {
        match self.by_node.get(&node) {
            Some(holder) if *holder != client => false,
            _ => {
                // A client moving to another node implicitly gives up the
                // old one.
                if let Some(previous) = self.by_client.insert(client, node)
                    && previous != node
                {
                    self.by_node.remove(&previous);
                }
                self.by_node.insert(node, client);
                debug!("client {} holds node {}", client, node);
                true
            }
        }
    }

    pub fn release(&mut self, node: NodeId) {
        if let Some(client) = self.by_node.remove(&node) {
            self.by_client.remove(&client);
        }
    }

    /// Releases whatever node this client holds, returning it.
    pub fn release_client(&mut self, client: ClientId) -> Option<NodeId> {
        let node = self.by_client.remove(&client)?;
        self.by_node.remove(&node);
        debug!("client {} released node {}", client, node);
        Some(node)
    }

    pub fn holder(&self, node: NodeId) -> Option<ClientId> {
        self.by_node.get(&node).copied()
    }

    pub fn client_device(&self, client: ClientId) -> Option<NodeId> {
        self.by_client.get(&client).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        self.by_node.len() == self.by_client.len()
            && self
                .by_node
                .iter()
                .all(|(node, client)| self.by_client.get(client) == Some(node))
    }
}
