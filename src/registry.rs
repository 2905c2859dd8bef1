//! In-memory forest of nodes.
//!
//! Thread-safe registry mapping node ids to shared node handles. Each
//! node carries its own lock; the registry's sharded map serializes
//! insertion per node id, so concurrent create requests for the same id
//! produce exactly one winner.

use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::BareJid;
use tokio::sync::RwLock;
use tracing::info;

use crate::node::{Node, NodeConfig};
use crate::service::ROOT_NODE_ID;

/// Shared handle to a node.
pub type NodeHandle = Arc<RwLock<Node>>;

/// Registry of all nodes hosted by the service.
pub struct NodeRegistry {
    nodes: DashMap<String, NodeHandle>,
    root: Option<NodeHandle>,
    leaf_defaults: StdRwLock<NodeConfig>,
    collection_defaults: StdRwLock<NodeConfig>,
}

impl NodeRegistry {
    /// Create a registry, with a root collection node when the service
    /// supports collections.
    pub fn new(service_address: &BareJid, collections_supported: bool) -> Self {
        let nodes = DashMap::new();
        let root = if collections_supported {
            let root_node = Node::new_collection(
                ROOT_NODE_ID,
                None,
                service_address.clone(),
                NodeConfig::collection_defaults(),
            );
            let handle: NodeHandle = Arc::new(RwLock::new(root_node));
            nodes.insert(ROOT_NODE_ID.to_string(), Arc::clone(&handle));
            Some(handle)
        } else {
            None
        };
        info!(
            service = %service_address,
            collections = collections_supported,
            "node registry initialized"
        );
        Self {
            nodes,
            root,
            leaf_defaults: StdRwLock::new(NodeConfig::leaf_defaults()),
            collection_defaults: StdRwLock::new(NodeConfig::collection_defaults()),
        }
    }

    /// Look up a node by id.
    pub fn get(&self, node_id: &str) -> Option<NodeHandle> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// The root collection node, when collections are supported.
    pub fn root(&self) -> Option<NodeHandle> {
        self.root.as_ref().map(Arc::clone)
    }

    /// Whether a node with this id exists.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of hosted nodes, including the root collection.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry holds no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a freshly created node unless its id is already taken.
    ///
    /// The map's entry API holds the shard lock across the check and the
    /// insert, which is what makes create races lose cleanly.
    pub fn insert_if_absent(&self, node: Node) -> Result<NodeHandle, ()> {
        match self.nodes.entry(node.id().to_string()) {
            Entry::Occupied(_) => Err(()),
            Entry::Vacant(vacant) => {
                let handle: NodeHandle = Arc::new(RwLock::new(node));
                vacant.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Remove a node from the registry.
    pub fn remove(&self, node_id: &str) -> Option<NodeHandle> {
        self.nodes.remove(node_id).map(|(_, handle)| handle)
    }

    /// Snapshot of all node handles.
    pub fn all(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Service default configuration for the given node kind, when that
    /// kind is supported.
    pub fn default_config(&self, collection: bool) -> Option<NodeConfig> {
        if collection {
            self.root.as_ref()?;
            Some(self.collection_defaults.read().expect("defaults lock").clone())
        } else {
            Some(self.leaf_defaults.read().expect("defaults lock").clone())
        }
    }

    /// Replace the service defaults for leaf nodes.
    pub fn set_leaf_defaults(&self, config: NodeConfig) {
        *self.leaf_defaults.write().expect("defaults lock") = config;
    }

    /// Replace the service defaults for collection nodes.
    pub fn set_collection_defaults(&self, config: NodeConfig) {
        *self.collection_defaults.write().expect("defaults lock") = config;
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_count", &self.nodes.len())
            .field("has_root", &self.root.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(&"pubsub.example.com".parse().expect("valid jid"), true)
    }

    fn leaf(id: &str) -> Node {
        Node::new_leaf(
            id,
            Some(ROOT_NODE_ID.to_string()),
            "alice@example.com".parse().expect("valid jid"),
            NodeConfig::leaf_defaults(),
        )
    }

    #[test]
    fn test_registry_creates_root_collection() {
        let registry = registry();
        assert!(registry.root().is_some());
        assert!(registry.contains(ROOT_NODE_ID));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_root_without_collection_support() {
        let registry =
            NodeRegistry::new(&"pubsub.example.com".parse().expect("valid jid"), false);
        assert!(registry.root().is_none());
        assert!(registry.is_empty());
        assert!(registry.default_config(true).is_none());
        assert!(registry.default_config(false).is_some());
    }

    #[test]
    fn test_insert_if_absent_detects_duplicates() {
        let registry = registry();

        assert!(registry.insert_if_absent(leaf("/blog")).is_ok());
        assert!(registry.insert_if_absent(leaf("/blog")).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_forgets_node() {
        let registry = registry();
        registry.insert_if_absent(leaf("/blog")).expect("insert");

        assert!(registry.remove("/blog").is_some());
        assert!(!registry.contains("/blog"));
        assert!(registry.remove("/blog").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_create_has_one_winner() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.insert_if_absent(leaf("/race")).is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_default_config_swap() {
        let registry = registry();
        let mut config = NodeConfig::leaf_defaults();
        config.max_items = 3;
        registry.set_leaf_defaults(config);

        assert_eq!(registry.default_config(false).expect("defaults").max_items, 3);
    }
}
