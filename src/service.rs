//! Service configuration and the context handed to the engine.
//!
//! The engine has no global state. Everything it needs from the host
//! (router, user directory, persistence backend, ad-hoc command manager,
//! clock, and service policy) travels in a [`ServiceContext`] passed at
//! construction time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};

use crate::backend::PubSubBackend;
use crate::commands::AdHocCommands;
use crate::router::Router;

/// Default period between persistence flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(120);

/// Default number of queued items written or deleted per flush.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 50;

/// Node id of the root collection node.
///
/// The empty string keeps child node ids readable: a leaf created as
/// `blog` directly under the root becomes `/blog`.
pub const ROOT_NODE_ID: &str = "";

/// Service-wide PubSub policy and identity.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address of the PubSub service, e.g. `pubsub.example.com`.
    pub address: BareJid,
    /// Whether collection nodes (and the root collection) exist.
    pub collection_nodes_supported: bool,
    /// Whether node creation without a node id is allowed.
    pub instant_nodes_supported: bool,
    /// When set, only service admins may create nodes.
    pub node_creation_restricted: bool,
    /// Bare JIDs with unconditional admin rights on the service.
    pub admins: HashSet<BareJid>,
    /// Period between persistence flushes.
    pub flush_interval: Duration,
    /// Number of queued items written or deleted per flush.
    pub flush_batch_size: usize,
}

impl ServiceConfig {
    /// Create a configuration with default policy for the given address.
    pub fn new(address: BareJid) -> Self {
        Self {
            address,
            collection_nodes_supported: true,
            instant_nodes_supported: true,
            node_creation_restricted: false,
            admins: HashSet::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
        }
    }

    /// Register a service admin.
    pub fn with_admin(mut self, admin: BareJid) -> Self {
        self.admins.insert(admin);
        self
    }

    /// Whether `jid` is a service admin.
    pub fn is_admin(&self, jid: &Jid) -> bool {
        self.admins.contains(&jid.to_bare())
    }

    /// Whether `jid` may create nodes on this service.
    pub fn can_create_node(&self, jid: &Jid) -> bool {
        !self.node_creation_restricted || self.is_admin(jid)
    }
}

/// Host-provided user and roster directory.
///
/// The presence and roster access models need visibility into the host's
/// contact data; the engine itself never stores rosters.
pub trait UserDirectory: Send + Sync + 'static {
    /// Whether `user` is a registered (non-anonymous) user.
    fn is_registered(&self, user: &BareJid) -> bool;

    /// Whether `owner` has authorized `user` to see its presence.
    fn has_presence_subscription(&self, owner: &BareJid, user: &BareJid) -> bool;

    /// Roster groups of `owner` that `user` belongs to.
    fn roster_groups(&self, owner: &BareJid, user: &BareJid) -> Vec<String>;
}

/// Time source, injectable for tests.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Handles to every collaborator the engine consumes.
pub struct ServiceContext {
    /// Service policy and identity.
    pub config: ServiceConfig,
    /// Outbound stanza router.
    pub router: Arc<dyn Router>,
    /// User and roster directory.
    pub users: Arc<dyn UserDirectory>,
    /// Persistence backend.
    pub backend: Arc<dyn PubSubBackend>,
    /// Ad-hoc command manager.
    pub commands: Arc<dyn AdHocCommands>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig::new("pubsub.example.com".parse().expect("valid jid"))
            .with_admin("admin@example.com".parse().expect("valid jid"))
    }

    #[test]
    fn test_admin_matches_on_bare_jid() {
        let config = config();
        let full: Jid = "admin@example.com/laptop".parse().expect("valid jid");
        assert!(config.is_admin(&full));

        let other: Jid = "alice@example.com".parse().expect("valid jid");
        assert!(!config.is_admin(&other));
    }

    #[test]
    fn test_node_creation_policy() {
        let mut config = config();
        let user: Jid = "alice@example.com".parse().expect("valid jid");
        assert!(config.can_create_node(&user));

        config.node_creation_restricted = true;
        assert!(!config.can_create_node(&user));
        let admin: Jid = "admin@example.com".parse().expect("valid jid");
        assert!(config.can_create_node(&admin));
    }
}
