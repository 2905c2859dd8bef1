//! Common protocol vocabulary for the PubSub service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Affiliation of an entity with a node (XEP-0060 section 4.1).
///
/// Affiliations are long-lived and bound to the bare JID of the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Affiliation {
    /// Owns the node; may configure, delete, and manage other affiliations.
    Owner,
    /// May publish items to the node.
    Publisher,
    /// May subscribe and retrieve items.
    Member,
    /// No affiliation.
    #[default]
    None,
    /// Banned from the node.
    Outcast,
}

impl Affiliation {
    /// Parse an affiliation from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Affiliation::Owner),
            "publisher" => Some(Affiliation::Publisher),
            "member" => Some(Affiliation::Member),
            "none" => Some(Affiliation::None),
            "outcast" => Some(Affiliation::Outcast),
            _ => None,
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        };
        write!(f, "{}", s)
    }
}

/// State of a subscription to a node (XEP-0060 section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubscriptionState {
    /// No subscription exists (only used in state change notifications).
    #[default]
    None,
    /// Waiting for owner approval.
    Pending,
    /// Approved but the subscriber must still configure the subscription.
    Unconfigured,
    /// Active subscription; events are delivered.
    Subscribed,
}

impl SubscriptionState {
    /// Parse a subscription state from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SubscriptionState::None),
            "pending" => Some(SubscriptionState::Pending),
            "unconfigured" => Some(SubscriptionState::Unconfigured),
            "subscribed" => Some(SubscriptionState::Subscribed),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Unconfigured => "unconfigured",
            SubscriptionState::Subscribed => "subscribed",
        };
        write!(f, "{}", s)
    }
}

/// What a subscription delivers.
///
/// `Nodes` only makes sense for subscriptions to collection nodes, where
/// the subscriber is notified about child node changes rather than items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubscriptionType {
    /// Notifications about published items.
    #[default]
    Items,
    /// Notifications about nodes added to or removed from a collection.
    Nodes,
}

impl SubscriptionType {
    /// Parse a subscription type from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionType::Items => "items",
            SubscriptionType::Nodes => "nodes",
        };
        write!(f, "{}", s)
    }
}

/// Publisher model for a node: who may publish items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PublisherModel {
    /// Anyone may publish.
    Open,
    /// Only owners and publishers may publish.
    #[default]
    Publishers,
    /// Owners, publishers, and subscribers may publish.
    Subscribers,
}

impl PublisherModel {
    /// Parse a publisher model from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PublisherModel::Open),
            "publishers" => Some(PublisherModel::Publishers),
            "subscribers" => Some(PublisherModel::Subscribers),
            _ => None,
        }
    }
}

impl fmt::Display for PublisherModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublisherModel::Open => "open",
            PublisherModel::Publishers => "publishers",
            PublisherModel::Subscribers => "subscribers",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_round_trip() {
        for name in ["owner", "publisher", "member", "none", "outcast"] {
            let parsed = Affiliation::from_str(name).expect("known affiliation");
            assert_eq!(parsed.to_string(), name);
        }
        assert_eq!(Affiliation::from_str("admin"), None);
    }

    #[test]
    fn test_subscription_state_round_trip() {
        for name in ["none", "pending", "unconfigured", "subscribed"] {
            let parsed = SubscriptionState::from_str(name).expect("known state");
            assert_eq!(parsed.to_string(), name);
        }
        assert_eq!(SubscriptionState::from_str("active"), None);
    }

    #[test]
    fn test_publisher_model_parse() {
        assert_eq!(PublisherModel::from_str("open"), Some(PublisherModel::Open));
        assert_eq!(
            PublisherModel::from_str("publishers"),
            Some(PublisherModel::Publishers)
        );
        assert_eq!(PublisherModel::from_str("invalid"), None);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Affiliation::default(), Affiliation::None);
        assert_eq!(SubscriptionType::default(), SubscriptionType::Items);
        assert_eq!(PublisherModel::default(), PublisherModel::Publishers);
    }
}
