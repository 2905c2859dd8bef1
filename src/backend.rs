//! Persistence backend contract and an in-memory reference implementation.
//!
//! The engine owns the canonical in-memory state; the backend only makes
//! it durable. Node, affiliation, and subscription writes happen on the
//! request path (they are rare), while item writes are batched by the
//! background flusher. Item operations answer a plain success flag
//! because the batcher's only failure handling is to retry.

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::EngineError;
use crate::node::{Node, NodeAffiliate, NodeSubscription, PublishedItem};

/// Storage operations the engine consumes.
#[async_trait]
pub trait PubSubBackend: Send + Sync + 'static {
    /// Load every stored node at service start.
    async fn load_nodes(&self) -> Result<Vec<Node>, EngineError>;

    /// Create or update a node.
    async fn save_node(&self, node: &Node) -> Result<(), EngineError>;

    /// Delete a node and everything hanging off it.
    async fn delete_node(&self, node_id: &str) -> Result<(), EngineError>;

    /// Create or update an affiliation.
    async fn save_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), EngineError>;

    /// Remove an affiliation.
    async fn remove_affiliation(&self, node_id: &str, jid: &BareJid) -> Result<(), EngineError>;

    /// Create or update a subscription.
    async fn save_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), EngineError>;

    /// Remove a subscription.
    async fn remove_subscription(
        &self,
        node_id: &str,
        subscription_id: &str,
    ) -> Result<(), EngineError>;

    /// Write a published item. Must be idempotent on `(node, item id)`.
    /// Answers whether the write succeeded.
    async fn create_published_item(&self, item: &PublishedItem) -> bool;

    /// Delete a published item. Answers whether the delete succeeded.
    async fn remove_published_item(&self, item: &PublishedItem) -> bool;
}

/// In-memory backend for tests and single-process deployments.
///
/// Item writes can be made to fail on demand, which is how the batcher's
/// retry behavior is exercised in tests.
#[derive(Default)]
pub struct InMemoryBackend {
    nodes: DashMap<String, Node>,
    affiliations: DashMap<(String, String), NodeAffiliate>,
    subscriptions: DashMap<(String, String), NodeSubscription>,
    items: DashMap<(String, String), PublishedItem>,
    fail_item_writes: AtomicBool,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make item writes and deletes fail until re-enabled.
    pub fn set_fail_item_writes(&self, fail: bool) {
        self.fail_item_writes.store(fail, Ordering::Relaxed);
    }

    /// Stored items of one node, in no particular order.
    pub fn items_for_node(&self, node_id: &str) -> Vec<PublishedItem> {
        self.items
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of stored items across all nodes.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Whether a node is stored.
    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }
}

#[async_trait]
impl PubSubBackend for InMemoryBackend {
    async fn load_nodes(&self) -> Result<Vec<Node>, EngineError> {
        Ok(self.nodes.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save_node(&self, node: &Node) -> Result<(), EngineError> {
        self.nodes.insert(node.id().to_string(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), EngineError> {
        self.nodes.remove(node_id);
        self.affiliations.retain(|key, _| key.0 != node_id);
        self.subscriptions.retain(|key, _| key.0 != node_id);
        self.items.retain(|key, _| key.0 != node_id);
        Ok(())
    }

    async fn save_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), EngineError> {
        self.affiliations.insert(
            (node_id.to_string(), affiliate.jid.to_string()),
            affiliate.clone(),
        );
        Ok(())
    }

    async fn remove_affiliation(&self, node_id: &str, jid: &BareJid) -> Result<(), EngineError> {
        self.affiliations
            .remove(&(node_id.to_string(), jid.to_string()));
        Ok(())
    }

    async fn save_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), EngineError> {
        self.subscriptions.insert(
            (node_id.to_string(), subscription.id.clone()),
            subscription.clone(),
        );
        Ok(())
    }

    async fn remove_subscription(
        &self,
        node_id: &str,
        subscription_id: &str,
    ) -> Result<(), EngineError> {
        self.subscriptions
            .remove(&(node_id.to_string(), subscription_id.to_string()));
        Ok(())
    }

    async fn create_published_item(&self, item: &PublishedItem) -> bool {
        if self.fail_item_writes.load(Ordering::Relaxed) {
            return false;
        }
        self.items
            .insert((item.node_id.clone(), item.id.clone()), item.clone());
        true
    }

    async fn remove_published_item(&self, item: &PublishedItem) -> bool {
        if self.fail_item_writes.load(Ordering::Relaxed) {
            return false;
        }
        self.items.remove(&(item.node_id.clone(), item.id.clone()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use chrono::Utc;

    fn item(node: &str, id: &str) -> PublishedItem {
        PublishedItem {
            node_id: node.to_string(),
            id: id.to_string(),
            publisher: "alice@example.com".parse().expect("valid jid"),
            payload: None,
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_item_create_is_idempotent() {
        let backend = InMemoryBackend::new();

        assert!(backend.create_published_item(&item("/blog", "i1")).await);
        assert!(backend.create_published_item(&item("/blog", "i1")).await);
        assert_eq!(backend.item_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_writes_report_failure() {
        let backend = InMemoryBackend::new();
        backend.set_fail_item_writes(true);

        assert!(!backend.create_published_item(&item("/blog", "i1")).await);
        assert_eq!(backend.item_count(), 0);

        backend.set_fail_item_writes(false);
        assert!(backend.create_published_item(&item("/blog", "i1")).await);
    }

    #[tokio::test]
    async fn test_delete_node_cascades() {
        let backend = InMemoryBackend::new();
        let node = Node::new_leaf(
            "/blog",
            None,
            "alice@example.com".parse().expect("valid jid"),
            NodeConfig::leaf_defaults(),
        );
        backend.save_node(&node).await.expect("save");
        backend.create_published_item(&item("/blog", "i1")).await;
        backend.create_published_item(&item("/other", "i1")).await;

        backend.delete_node("/blog").await.expect("delete");

        assert!(!backend.has_node("/blog"));
        assert!(backend.items_for_node("/blog").is_empty());
        assert_eq!(backend.items_for_node("/other").len(), 1);
    }

    #[tokio::test]
    async fn test_load_nodes_round_trip() {
        let backend = InMemoryBackend::new();
        let node = Node::new_leaf(
            "/blog",
            None,
            "alice@example.com".parse().expect("valid jid"),
            NodeConfig::leaf_defaults(),
        );
        backend.save_node(&node).await.expect("save");

        let loaded = backend.load_nodes().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "/blog");
    }
}
