//! Access models: who may subscribe to a node and read its items.

use std::fmt;

use jid::{BareJid, Jid};

use crate::error::{ErrorDetail, PubSubError};
use crate::node::Node;
use crate::service::UserDirectory;
use crate::types::Affiliation;

/// Access model of a node (XEP-0060 section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessModel {
    /// Anyone may subscribe and retrieve items.
    #[default]
    Open,
    /// Only entities the owner shares presence with.
    Presence,
    /// Only entities in the allowed roster groups of an owner.
    Roster,
    /// Subscriptions require explicit owner approval.
    Authorize,
    /// Only entities with an affiliation on the node.
    Whitelist,
}

impl AccessModel {
    /// Parse an access model from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "authorize" => Some(AccessModel::Authorize),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }

    /// Whether new subscriptions start out pending owner approval.
    pub fn authorization_required(&self) -> bool {
        matches!(self, AccessModel::Authorize)
    }

    /// Whether `subscriber` (owned by `owner`) may subscribe to `node`.
    ///
    /// For the authorize model this answers true: the subscription is
    /// admitted but parked in the pending state.
    pub fn can_subscribe(
        &self,
        node: &Node,
        owner: &BareJid,
        _subscriber: &Jid,
        directory: &dyn UserDirectory,
    ) -> bool {
        match self {
            AccessModel::Open | AccessModel::Authorize => true,
            AccessModel::Presence => presence_shared(node, owner, directory),
            AccessModel::Roster => in_allowed_group(node, owner, directory),
            AccessModel::Whitelist => on_whitelist(node, owner),
        }
    }

    /// Whether `subscriber` (owned by `owner`) may retrieve items.
    pub fn can_access_items(
        &self,
        node: &Node,
        owner: &BareJid,
        _subscriber: &Jid,
        directory: &dyn UserDirectory,
    ) -> bool {
        match self {
            AccessModel::Open => true,
            AccessModel::Presence => presence_shared(node, owner, directory),
            AccessModel::Roster => in_allowed_group(node, owner, directory),
            AccessModel::Authorize => node
                .subscriptions_for(owner)
                .iter()
                .any(|sub| sub.is_active()),
            AccessModel::Whitelist => on_whitelist(node, owner),
        }
    }

    /// The error answered when this model refuses a request.
    pub fn refusal(&self) -> PubSubError {
        match self {
            AccessModel::Open => PubSubError::bad_request(),
            AccessModel::Presence => {
                PubSubError::not_authorized().with_detail(ErrorDetail::PresenceSubscriptionRequired)
            }
            AccessModel::Roster => {
                PubSubError::not_authorized().with_detail(ErrorDetail::NotInRosterGroup)
            }
            AccessModel::Authorize => {
                PubSubError::not_authorized().with_detail(ErrorDetail::NotSubscribed)
            }
            AccessModel::Whitelist => {
                PubSubError::not_allowed().with_detail(ErrorDetail::ClosedNode)
            }
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Authorize => "authorize",
            AccessModel::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

fn presence_shared(node: &Node, owner: &BareJid, directory: &dyn UserDirectory) -> bool {
    node.owners()
        .iter()
        .any(|node_owner| directory.has_presence_subscription(node_owner, owner))
}

fn in_allowed_group(node: &Node, owner: &BareJid, directory: &dyn UserDirectory) -> bool {
    let allowed = &node.config().roster_groups_allowed;
    if allowed.is_empty() {
        return false;
    }
    node.owners().iter().any(|node_owner| {
        directory
            .roster_groups(node_owner, owner)
            .iter()
            .any(|group| allowed.contains(group))
    })
}

fn on_whitelist(node: &Node, owner: &BareJid) -> bool {
    node.affiliation_of(owner)
        .map(|affiliation| affiliation != Affiliation::Outcast)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::stanza_error::DefinedCondition;

    #[test]
    fn test_access_model_round_trip() {
        for name in ["open", "presence", "roster", "authorize", "whitelist"] {
            let parsed = AccessModel::from_str(name).expect("known model");
            assert_eq!(parsed.to_string(), name);
        }
        assert_eq!(AccessModel::from_str("closed"), None);
    }

    #[test]
    fn test_only_authorize_requires_authorization() {
        assert!(AccessModel::Authorize.authorization_required());
        assert!(!AccessModel::Open.authorization_required());
        assert!(!AccessModel::Whitelist.authorization_required());
    }

    #[test]
    fn test_refusal_conditions() {
        let whitelist = AccessModel::Whitelist.refusal();
        assert_eq!(whitelist.condition, DefinedCondition::NotAllowed);
        assert_eq!(whitelist.detail, Some(ErrorDetail::ClosedNode));

        let presence = AccessModel::Presence.refusal();
        assert_eq!(presence.condition, DefinedCondition::NotAuthorized);
        assert_eq!(
            presence.detail,
            Some(ErrorDetail::PresenceSubscriptionRequired)
        );
    }
}
