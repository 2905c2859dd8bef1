//! Node configuration and its data form round trip.

use std::fmt;

use jid::BareJid;
use minidom::Element;

use crate::access::AccessModel;
use crate::forms::{DataForm, FormKind, FORM_TYPE_NODE_CONFIG};
use crate::types::PublisherModel;

/// Default bound on the item history of a leaf node.
pub const DEFAULT_MAX_ITEMS: usize = 50;

/// Who may associate new child nodes with a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssociationPolicy {
    /// Anyone.
    #[default]
    All,
    /// Collection owners only.
    Owners,
    /// Only JIDs on the association whitelist.
    Whitelist,
}

impl AssociationPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            AssociationPolicy::All => "all",
            AssociationPolicy::Owners => "owners",
            AssociationPolicy::Whitelist => "whitelist",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(AssociationPolicy::All),
            "owners" => Some(AssociationPolicy::Owners),
            "whitelist" => Some(AssociationPolicy::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for AssociationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration of a node.
///
/// One struct covers both kinds; the collection-only fields are inert on
/// leaves. Defaults differ per kind and are held service-wide by the node
/// registry, where owners of the service can adjust them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Human readable node title.
    pub title: String,
    /// Who may subscribe and retrieve items.
    pub access_model: AccessModel,
    /// Who may publish.
    pub publisher_model: PublisherModel,
    /// Whether new subscriptions are accepted at all.
    pub subscription_enabled: bool,
    /// Whether one entity may hold several subscriptions.
    pub multiple_subscriptions: bool,
    /// Whether notifications carry the item payload.
    pub deliver_payloads: bool,
    /// Whether items are written to the persistence backend.
    pub persist_items: bool,
    /// Bound on the in-memory item history.
    pub max_items: usize,
    /// Whether retractions are broadcast to subscribers.
    pub notify_retract: bool,
    /// Whether node deletion is broadcast to subscribers.
    pub notify_delete: bool,
    /// Roster groups admitted by the `roster` access model.
    pub roster_groups_allowed: Vec<String>,
    /// Collection only: who may associate child nodes.
    pub association_policy: AssociationPolicy,
    /// Collection only: JIDs admitted by the whitelist association policy.
    pub association_whitelist: Vec<BareJid>,
    /// Collection only: bound on the number of child leaf nodes.
    pub max_leaf_nodes: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_defaults()
    }
}

impl NodeConfig {
    /// Service defaults for leaf nodes.
    pub fn leaf_defaults() -> Self {
        Self {
            title: String::new(),
            access_model: AccessModel::Open,
            publisher_model: PublisherModel::Publishers,
            subscription_enabled: true,
            multiple_subscriptions: false,
            deliver_payloads: true,
            persist_items: true,
            max_items: DEFAULT_MAX_ITEMS,
            notify_retract: true,
            notify_delete: true,
            roster_groups_allowed: Vec::new(),
            association_policy: AssociationPolicy::All,
            association_whitelist: Vec::new(),
            max_leaf_nodes: None,
        }
    }

    /// Service defaults for collection nodes.
    pub fn collection_defaults() -> Self {
        Self {
            deliver_payloads: false,
            persist_items: false,
            max_items: 0,
            ..Self::leaf_defaults()
        }
    }

    /// Whether a publish request must carry items.
    ///
    /// Nodes that neither persist items nor deliver payloads are pure
    /// notification nodes and refuse items instead.
    pub fn item_required(&self) -> bool {
        self.persist_items || self.deliver_payloads
    }

    /// Apply a submitted `pubsub#node_config` form.
    ///
    /// Unknown fields are ignored; missing fields keep their value. Owner
    /// changes (`pubsub#owner`) are handled by the node, not here.
    pub fn apply_form(&mut self, form: &DataForm) {
        if let Some(title) = form.value("pubsub#title") {
            self.title = title.to_string();
        }
        if let Some(model) = form.value("pubsub#access_model").and_then(AccessModel::from_str) {
            self.access_model = model;
        }
        if let Some(model) = form
            .value("pubsub#publish_model")
            .and_then(PublisherModel::from_str)
        {
            self.publisher_model = model;
        }
        if let Some(enabled) = form.bool_value("pubsub#subscribe") {
            self.subscription_enabled = enabled;
        }
        if let Some(multiple) = form.bool_value("pubsub#multiple_subscriptions") {
            self.multiple_subscriptions = multiple;
        }
        if let Some(deliver) = form.bool_value("pubsub#deliver_payloads") {
            self.deliver_payloads = deliver;
        }
        if let Some(persist) = form.bool_value("pubsub#persist_items") {
            self.persist_items = persist;
        }
        if let Some(max) = form.value("pubsub#max_items").and_then(|v| v.parse().ok()) {
            self.max_items = max;
        }
        if let Some(notify) = form.bool_value("pubsub#notify_retract") {
            self.notify_retract = notify;
        }
        if let Some(notify) = form.bool_value("pubsub#notify_delete") {
            self.notify_delete = notify;
        }
        if form.field("pubsub#roster_groups_allowed").is_some() {
            self.roster_groups_allowed = form.values("pubsub#roster_groups_allowed").to_vec();
        }
        if let Some(policy) = form
            .value("pubsub#children_association_policy")
            .and_then(AssociationPolicy::from_str)
        {
            self.association_policy = policy;
        }
        if form.field("pubsub#children_association_whitelist").is_some() {
            self.association_whitelist = form
                .values("pubsub#children_association_whitelist")
                .iter()
                .filter_map(|jid| jid.parse().ok())
                .collect();
        }
        if let Some(max) = form.value("pubsub#children_max") {
            self.max_leaf_nodes = max.parse().ok();
        }
    }

    /// Serialize the configuration as a data form.
    pub fn to_form(&self, kind: FormKind, owners: &[BareJid], is_collection: bool) -> DataForm {
        let mut form = DataForm::new(kind)
            .with_form_type(FORM_TYPE_NODE_CONFIG)
            .with_field("pubsub#title", &self.title)
            .with_field("pubsub#access_model", self.access_model.to_string())
            .with_field("pubsub#publish_model", self.publisher_model.to_string())
            .with_field(
                "pubsub#subscribe",
                if self.subscription_enabled { "1" } else { "0" },
            )
            .with_field(
                "pubsub#multiple_subscriptions",
                if self.multiple_subscriptions { "1" } else { "0" },
            )
            .with_values(
                "pubsub#roster_groups_allowed",
                self.roster_groups_allowed.clone(),
            )
            .with_values(
                "pubsub#owner",
                owners.iter().map(|jid| jid.to_string()).collect(),
            );
        if is_collection {
            form = form
                .with_field(
                    "pubsub#children_association_policy",
                    self.association_policy.as_str(),
                )
                .with_values(
                    "pubsub#children_association_whitelist",
                    self.association_whitelist
                        .iter()
                        .map(|jid| jid.to_string())
                        .collect(),
                )
                .with_field(
                    "pubsub#children_max",
                    self.max_leaf_nodes
                        .map(|max| max.to_string())
                        .unwrap_or_default(),
                );
        } else {
            form = form
                .with_field(
                    "pubsub#deliver_payloads",
                    if self.deliver_payloads { "1" } else { "0" },
                )
                .with_field(
                    "pubsub#persist_items",
                    if self.persist_items { "1" } else { "0" },
                )
                .with_field("pubsub#max_items", self.max_items.to_string())
                .with_field(
                    "pubsub#notify_retract",
                    if self.notify_retract { "1" } else { "0" },
                )
                .with_field(
                    "pubsub#notify_delete",
                    if self.notify_delete { "1" } else { "0" },
                );
        }
        form
    }

    /// Serialize as the `x` element of a default-configuration reply.
    pub fn to_default_form_element(&self, is_collection: bool) -> Element {
        self.to_form(FormKind::Form, &[], is_collection).to_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_defaults() {
        let config = NodeConfig::leaf_defaults();
        assert_eq!(config.access_model, AccessModel::Open);
        assert!(config.persist_items);
        assert!(config.item_required());
        assert_eq!(config.max_items, DEFAULT_MAX_ITEMS);
    }

    #[test]
    fn test_collection_defaults_do_not_persist() {
        let config = NodeConfig::collection_defaults();
        assert!(!config.persist_items);
        assert!(!config.deliver_payloads);
        assert!(!config.item_required());
    }

    #[test]
    fn test_apply_form_partial_update() {
        let mut config = NodeConfig::leaf_defaults();
        let form = DataForm::new(FormKind::Submit)
            .with_form_type(FORM_TYPE_NODE_CONFIG)
            .with_field("pubsub#access_model", "whitelist")
            .with_field("pubsub#persist_items", "0");

        config.apply_form(&form);

        assert_eq!(config.access_model, AccessModel::Whitelist);
        assert!(!config.persist_items);
        // Untouched fields keep their defaults.
        assert!(config.subscription_enabled);
        assert_eq!(config.max_items, DEFAULT_MAX_ITEMS);
    }

    #[test]
    fn test_form_round_trip() {
        let mut config = NodeConfig::leaf_defaults();
        config.title = "Blog".to_string();
        config.access_model = AccessModel::Roster;
        config.roster_groups_allowed = vec!["friends".to_string()];
        config.max_items = 7;

        let owners: Vec<BareJid> = vec!["alice@example.com".parse().expect("valid jid")];
        let form = config.to_form(FormKind::Submit, &owners, false);

        let mut read_back = NodeConfig::leaf_defaults();
        read_back.apply_form(&form);

        assert_eq!(read_back.title, "Blog");
        assert_eq!(read_back.access_model, AccessModel::Roster);
        assert_eq!(read_back.roster_groups_allowed, vec!["friends".to_string()]);
        assert_eq!(read_back.max_items, 7);
    }

    #[test]
    fn test_association_policy_parse() {
        assert_eq!(
            AssociationPolicy::from_str("owners"),
            Some(AssociationPolicy::Owners)
        );
        assert_eq!(AssociationPolicy::from_str("open"), None);
    }
}
