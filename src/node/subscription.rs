//! Subscriptions and their per-subscriber delivery options.

use jid::{BareJid, Jid};
use minidom::Element;

use crate::forms::{DataForm, FormKind, FORM_TYPE_SUBSCRIBE_OPTIONS};
use crate::node::item::PublishedItem;
use crate::presence::PresenceTracker;
use crate::types::{SubscriptionState, SubscriptionType};

/// How deep a collection subscription reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionDepth {
    /// Direct children only.
    #[default]
    One,
    /// The whole subtree.
    All,
}

impl SubscriptionDepth {
    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionDepth::One => "1",
            SubscriptionDepth::All => "all",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "1" => Some(SubscriptionDepth::One),
            "all" => Some(SubscriptionDepth::All),
            _ => None,
        }
    }
}

/// Per-subscription configuration, round-tripped through the
/// `pubsub#subscribe_options` data form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Master delivery switch.
    pub deliver: bool,
    /// Coalesce a publish batch into a single notification.
    pub digest: bool,
    /// Echo the payload text in a message body.
    pub include_body: bool,
    /// Presence show values the subscriber accepts delivery for.
    /// Empty means no presence filtering from the subscription side.
    pub show_values: Vec<String>,
    /// Items or nodes subscription.
    pub subscription_type: SubscriptionType,
    /// Collection subscription depth.
    pub depth: SubscriptionDepth,
    /// Only deliver items whose payload contains this keyword.
    pub keyword: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            digest: false,
            include_body: false,
            show_values: Vec::new(),
            subscription_type: SubscriptionType::Items,
            depth: SubscriptionDepth::One,
            keyword: None,
        }
    }
}

impl SubscriptionOptions {
    /// Read options from a submitted form, starting from the defaults.
    pub fn from_form(form: &DataForm) -> Self {
        let mut options = Self::default();
        options.apply(form);
        options
    }

    /// Apply a submitted options form, keeping current values for fields
    /// the form does not carry.
    pub fn apply(&mut self, form: &DataForm) {
        if let Some(deliver) = form.bool_value("pubsub#deliver") {
            self.deliver = deliver;
        }
        if let Some(digest) = form.bool_value("pubsub#digest") {
            self.digest = digest;
        }
        if let Some(include_body) = form.bool_value("pubsub#include_body") {
            self.include_body = include_body;
        }
        if form.field("pubsub#show-values").is_some() {
            self.show_values = form.values("pubsub#show-values").to_vec();
        }
        if let Some(subscription_type) = form
            .value("pubsub#subscription_type")
            .and_then(SubscriptionType::from_str)
        {
            self.subscription_type = subscription_type;
        }
        if let Some(depth) = form
            .value("pubsub#subscription_depth")
            .and_then(SubscriptionDepth::from_str)
        {
            self.depth = depth;
        }
        if let Some(keywords) = form.value("pubsub#keywords") {
            self.keyword = if keywords.is_empty() {
                None
            } else {
                Some(keywords.to_string())
            };
        }
    }

    /// Serialize the options as a data form of the given kind.
    pub fn to_form(&self, kind: FormKind) -> DataForm {
        DataForm::new(kind)
            .with_form_type(FORM_TYPE_SUBSCRIBE_OPTIONS)
            .with_field("pubsub#deliver", if self.deliver { "1" } else { "0" })
            .with_field("pubsub#digest", if self.digest { "1" } else { "0" })
            .with_field(
                "pubsub#include_body",
                if self.include_body { "1" } else { "0" },
            )
            .with_values("pubsub#show-values", self.show_values.clone())
            .with_field(
                "pubsub#subscription_type",
                self.subscription_type.to_string(),
            )
            .with_field("pubsub#subscription_depth", self.depth.as_str())
            .with_field("pubsub#keywords", self.keyword.clone().unwrap_or_default())
    }

    /// Whether this subscription gates delivery on the subscriber's presence.
    pub fn presence_based_delivery(&self) -> bool {
        !self.show_values.is_empty()
    }
}

/// One subscription of an entity to a node.
#[derive(Debug, Clone)]
pub struct NodeSubscription {
    /// Service-generated subscription id.
    pub id: String,
    /// Bare JID owning the subscription.
    pub owner: BareJid,
    /// Address notifications are sent to; may carry a resource.
    pub subscriber: Jid,
    /// Current lifecycle state.
    pub state: SubscriptionState,
    /// Delivery options.
    pub options: SubscriptionOptions,
}

impl NodeSubscription {
    /// Create a subscription in the given initial state.
    pub fn new(owner: BareJid, subscriber: Jid, state: SubscriptionState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            subscriber,
            state,
            options: SubscriptionOptions::default(),
        }
    }

    /// Whether events are currently delivered to this subscription.
    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }

    /// Whether `actor` may read or change this subscription: the
    /// subscription owner or the exact subscriber address.
    pub fn can_modify(&self, actor: &Jid) -> bool {
        actor.to_bare() == self.owner || *actor == self.subscriber
    }

    /// Whether `item` passes the keyword filter of this subscription.
    pub fn matches_keyword(&self, item: &PublishedItem) -> bool {
        match self.options.keyword {
            Some(ref keyword) => item.matches_keyword(keyword),
            None => true,
        }
    }

    /// Decide whether `item` should be delivered, consulting the presence
    /// tracker when the node or the subscription gates on presence.
    pub fn should_deliver(
        &self,
        item: &PublishedItem,
        presence_gated_node: bool,
        presences: &PresenceTracker,
    ) -> bool {
        if !self.is_active() || !self.options.deliver {
            return false;
        }
        if !self.matches_keyword(item) {
            return false;
        }
        if presence_gated_node || self.options.presence_based_delivery() {
            let shows = presences.shows_for(&self.subscriber);
            if shows.is_empty() {
                return false;
            }
            if !self.options.show_values.is_empty()
                && !shows.iter().any(|s| self.options.show_values.contains(s))
            {
                return false;
            }
        }
        true
    }

    /// Build a `subscription` element describing the current state.
    pub fn to_element(&self, ns: &str, node_id: Option<&str>, include_subid: bool) -> Element {
        let mut builder = Element::builder("subscription", ns)
            .attr("jid", self.subscriber.to_string())
            .attr("subscription", self.state.to_string());
        if let Some(node_id) = node_id {
            builder = builder.attr("node", node_id);
        }
        if include_subid {
            builder = builder.attr("subid", &self.id);
        }
        builder.build()
    }
}
