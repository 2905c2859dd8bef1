//! Topic nodes: the data model the whole service revolves around.
//!
//! A node is either a leaf (holds published items) or a collection (holds
//! child nodes). Each node tracks its affiliates and subscriptions and
//! knows how to plan the notifications a mutation causes. Nodes never
//! route stanzas themselves: mutation methods run under the node's lock
//! and hand finished message elements back to the engine, which sends
//! them after the lock is released.

pub mod affiliate;
pub mod config;
pub mod item;
pub mod subscription;

pub use affiliate::NodeAffiliate;
pub use config::{AssociationPolicy, NodeConfig, DEFAULT_MAX_ITEMS};
pub use item::PublishedItem;
pub use subscription::{NodeSubscription, SubscriptionDepth, SubscriptionOptions};

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::debug;

use crate::access::AccessModel;
use crate::error::PubSubError;
use crate::forms::{DataForm, FormKind, FORM_TYPE_SUBSCRIBE_AUTHORIZATION};
use crate::ns;
use crate::presence::PresenceTracker;
use crate::service::ROOT_NODE_ID;
use crate::types::{Affiliation, PublisherModel, SubscriptionState};

/// Kind-specific node state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Holds published items in publication order.
    Leaf {
        /// Item history, oldest first, bounded by `max_items`.
        items: Vec<PublishedItem>,
        /// Generator for item ids the publisher did not supply.
        next_item_id: u64,
    },
    /// Holds references to child nodes.
    Collection {
        /// Ids of child nodes.
        children: BTreeSet<String>,
    },
}

/// Result of publishing a batch of items.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Items added or replaced by this publish, in document order.
    pub new_items: Vec<PublishedItem>,
    /// Items evicted because the history bound was reached.
    pub expired: Vec<PublishedItem>,
    /// Event messages to route, in delivery order.
    pub notifications: Vec<Element>,
}

/// Result of retracting items.
#[derive(Debug, Default)]
pub struct RetractOutcome {
    /// Items removed from the history.
    pub removed: Vec<PublishedItem>,
    /// Retraction notifications to route.
    pub notifications: Vec<Element>,
}

/// A PubSub topic node.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    kind: NodeKind,
    parent: Option<String>,
    creator: BareJid,
    config: NodeConfig,
    affiliates: HashMap<BareJid, Affiliation>,
    subscriptions: Vec<NodeSubscription>,
}

impl Node {
    /// Create a leaf node. The creator must still be registered as owner.
    pub fn new_leaf(
        id: impl Into<String>,
        parent: Option<String>,
        creator: BareJid,
        config: NodeConfig,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Leaf {
                items: Vec::new(),
                next_item_id: 1,
            },
            parent,
            creator,
            config,
            affiliates: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Create a collection node.
    pub fn new_collection(
        id: impl Into<String>,
        parent: Option<String>,
        creator: BareJid,
        config: NodeConfig,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Collection {
                children: BTreeSet::new(),
            },
            parent,
            creator,
            config,
            affiliates: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    /// The node id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node id as reported in listings: the root collection is omitted.
    pub fn listed_id(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            Some(&self.id)
        }
    }

    /// The parent collection's id, absent only on the root collection.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The JID that created the node.
    pub fn creator(&self) -> &BareJid {
        &self.creator
    }

    /// The node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether this node is a collection.
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::Collection { .. })
    }

    /// Whether this node is the service's root collection.
    pub fn is_root(&self) -> bool {
        self.id == ROOT_NODE_ID
    }

    // ------------------------------------------------------------------
    // Affiliations
    // ------------------------------------------------------------------

    /// Bare JIDs of all owners.
    pub fn owners(&self) -> Vec<BareJid> {
        self.affiliates
            .iter()
            .filter(|(_, affiliation)| **affiliation == Affiliation::Owner)
            .map(|(jid, _)| jid.clone())
            .collect()
    }

    /// Owner set, for item deletion checks.
    pub fn owner_set(&self) -> HashSet<BareJid> {
        self.owners().into_iter().collect()
    }

    /// Whether `jid` is a node owner.
    pub fn is_owner(&self, jid: &Jid) -> bool {
        self.affiliates.get(&jid.to_bare()) == Some(&Affiliation::Owner)
    }

    /// Affiliation of `jid`, if any is recorded.
    pub fn affiliation_of(&self, jid: &BareJid) -> Option<Affiliation> {
        self.affiliates.get(jid).copied()
    }

    /// All recorded affiliates.
    pub fn affiliates(&self) -> Vec<NodeAffiliate> {
        self.affiliates
            .iter()
            .map(|(jid, affiliation)| NodeAffiliate::new(jid.clone(), *affiliation))
            .collect()
    }

    /// Record or update the affiliation of `jid`.
    pub fn set_affiliation(&mut self, jid: BareJid, affiliation: Affiliation) {
        self.affiliates.insert(jid, affiliation);
    }

    /// Drop the affiliation record of `jid`.
    pub fn remove_affiliation(&mut self, jid: &BareJid) {
        self.affiliates.remove(jid);
    }

    /// Whether `publisher` may publish under the node's publisher model.
    pub fn can_publish(&self, publisher: &Jid) -> bool {
        let bare = publisher.to_bare();
        let affiliation = self.affiliates.get(&bare).copied();
        if affiliation == Some(Affiliation::Outcast) {
            return false;
        }
        match self.config.publisher_model {
            PublisherModel::Open => true,
            PublisherModel::Publishers => matches!(
                affiliation,
                Some(Affiliation::Owner) | Some(Affiliation::Publisher)
            ),
            PublisherModel::Subscribers => {
                matches!(
                    affiliation,
                    Some(Affiliation::Owner) | Some(Affiliation::Publisher)
                ) || self
                    .subscriptions_for(&bare)
                    .iter()
                    .any(|sub| sub.is_active())
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// All subscriptions on the node.
    pub fn subscriptions(&self) -> &[NodeSubscription] {
        &self.subscriptions
    }

    /// Find a subscription by its service-generated id.
    pub fn subscription_by_id(&self, sub_id: &str) -> Option<&NodeSubscription> {
        self.subscriptions.iter().find(|sub| sub.id == sub_id)
    }

    /// Find the subscription registered for the exact subscriber address.
    pub fn subscription_of(&self, subscriber: &Jid) -> Option<&NodeSubscription> {
        self.subscriptions
            .iter()
            .find(|sub| sub.subscriber == *subscriber)
    }

    /// All subscriptions owned by the given bare JID.
    pub fn subscriptions_for(&self, owner: &BareJid) -> Vec<&NodeSubscription> {
        self.subscriptions
            .iter()
            .filter(|sub| sub.owner == *owner)
            .collect()
    }

    /// Create a subscription, adding a member affiliation when the owner
    /// has none yet. Answers the created subscription.
    pub fn create_subscription(
        &mut self,
        owner: BareJid,
        subscriber: Jid,
        pending: bool,
        options: Option<SubscriptionOptions>,
    ) -> NodeSubscription {
        let state = if pending {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        };
        let mut subscription = NodeSubscription::new(owner.clone(), subscriber, state);
        if let Some(options) = options {
            subscription.options = options;
        }
        self.affiliates.entry(owner).or_insert(Affiliation::Member);
        self.subscriptions.push(subscription.clone());
        debug!(node = %self.id, subid = %subscription.id, state = %subscription.state, "subscription created");
        subscription
    }

    /// Remove a subscription. The member affiliation is dropped with the
    /// last subscription; stronger affiliations stay.
    pub fn cancel_subscription(&mut self, sub_id: &str) -> Option<NodeSubscription> {
        let index = self.subscriptions.iter().position(|sub| sub.id == sub_id)?;
        let removed = self.subscriptions.remove(index);
        let owner = removed.owner.clone();
        if self.subscriptions_for(&owner).is_empty()
            && self.affiliates.get(&owner) == Some(&Affiliation::Member)
        {
            self.affiliates.remove(&owner);
        }
        debug!(node = %self.id, subid = %removed.id, "subscription cancelled");
        Some(removed)
    }

    /// Apply a submitted options form to a subscription. Answers the
    /// updated subscription, or `None` for an unknown id.
    pub fn apply_subscription_options(
        &mut self,
        sub_id: &str,
        form: &DataForm,
    ) -> Option<NodeSubscription> {
        let subscription = self
            .subscriptions
            .iter_mut()
            .find(|sub| sub.id == sub_id)?;
        subscription.options.apply(form);
        Some(subscription.clone())
    }

    /// Apply an owner's authorization decision on a pending subscription.
    ///
    /// Approval activates the subscription; denial removes it. Either way
    /// the subscriber is told the resulting state. Answers the state
    /// change notification to route, or `None` for an unknown id.
    pub fn approve_subscription(
        &mut self,
        sub_id: &str,
        approved: bool,
        service: &BareJid,
    ) -> Option<Element> {
        if approved {
            let node_id = self.listed_id().map(str::to_string);
            let subscription = self
                .subscriptions
                .iter_mut()
                .find(|sub| sub.id == sub_id)?;
            subscription.state = SubscriptionState::Subscribed;
            let element = subscription.to_element(ns::PUBSUB_EVENT, node_id.as_deref(), true);
            let subscriber = subscription.subscriber.clone();
            Some(event_message(service, &subscriber, vec![element], None))
        } else {
            let mut removed = self.cancel_subscription(sub_id)?;
            removed.state = SubscriptionState::None;
            let element = removed.to_element(ns::PUBSUB_EVENT, self.listed_id(), true);
            Some(event_message(service, &removed.subscriber, vec![element], None))
        }
    }

    /// Authorization request messages for the owners of this node.
    pub fn authorization_requests(
        &self,
        subscription: &NodeSubscription,
        service: &BareJid,
    ) -> Vec<Element> {
        let form = DataForm::new(FormKind::Form)
            .with_form_type(FORM_TYPE_SUBSCRIBE_AUTHORIZATION)
            .with_field("pubsub#node", &self.id)
            .with_field("pubsub#subid", &subscription.id)
            .with_field("pubsub#subscriber_jid", subscription.subscriber.to_string())
            .with_field("pubsub#allow", "false");
        self.owners()
            .iter()
            .map(|owner| {
                Element::builder("message", ns::JABBER_CLIENT)
                    .attr("from", service.to_string())
                    .attr("to", owner.to_string())
                    .append(form.to_element())
                    .build()
            })
            .collect()
    }

    /// Subscribers whose delivery depends on presence, for startup probes.
    pub fn presence_based_subscribers(&self) -> Vec<Jid> {
        let node_gated = self.config.access_model == AccessModel::Presence;
        self.subscriptions
            .iter()
            .filter(|sub| node_gated || sub.options.presence_based_delivery())
            .map(|sub| sub.subscriber.clone())
            .collect()
    }

    /// Whether any subscription of `user` gates delivery on presence.
    pub fn is_presence_based_delivery(&self, user: &BareJid) -> bool {
        let node_gated = self.config.access_model == AccessModel::Presence;
        self.subscriptions
            .iter()
            .any(|sub| sub.owner == *user && (node_gated || sub.options.presence_based_delivery()))
    }

    // ------------------------------------------------------------------
    // Items (leaf nodes)
    // ------------------------------------------------------------------

    /// The item history, oldest first. Collections have none.
    pub fn published_items(&self) -> &[PublishedItem] {
        match &self.kind {
            NodeKind::Leaf { items, .. } => items,
            NodeKind::Collection { .. } => &[],
        }
    }

    /// Find an item by id.
    pub fn published_item(&self, item_id: &str) -> Option<&PublishedItem> {
        self.published_items().iter().find(|item| item.id == item_id)
    }

    /// The `n` most recent items, in publication order.
    pub fn recent_items(&self, n: usize) -> Vec<&PublishedItem> {
        let items = self.published_items();
        items[items.len().saturating_sub(n)..].iter().collect()
    }

    /// Publish a batch of item elements.
    ///
    /// Missing item ids are generated; an existing item with the same id
    /// is replaced; the history bound evicts the oldest items. Planned
    /// notifications honor each subscription's delivery policy.
    pub fn publish_items(
        &mut self,
        publisher: &Jid,
        item_elements: &[&Element],
        now: DateTime<Utc>,
        service: &BareJid,
        presences: &PresenceTracker,
    ) -> PublishOutcome {
        let node_id = self.id.clone();
        let max_items = self.config.max_items;
        let mut outcome = PublishOutcome::default();

        let NodeKind::Leaf {
            items,
            next_item_id,
        } = &mut self.kind
        else {
            return outcome;
        };

        for element in item_elements {
            let id = match element.attr("id") {
                Some(id) => id.to_string(),
                None => {
                    let id = next_item_id.to_string();
                    *next_item_id += 1;
                    id
                }
            };
            let item = PublishedItem {
                node_id: node_id.clone(),
                id,
                publisher: publisher.clone(),
                payload: element.children().next().cloned(),
                published_at: now,
            };
            if let Some(existing) = items.iter().position(|i| i.id == item.id) {
                items.remove(existing);
            }
            items.push(item.clone());
            outcome.new_items.push(item);
        }

        if max_items > 0 {
            while items.len() > max_items {
                outcome.expired.push(items.remove(0));
            }
        }

        outcome.notifications = self.item_notifications(&outcome.new_items, service, presences);
        outcome
    }

    /// Remove the given items from the history, notifying subscribers
    /// when the node is configured to broadcast retractions.
    pub fn delete_items(
        &mut self,
        to_remove: &[PublishedItem],
        service: &BareJid,
    ) -> RetractOutcome {
        let mut outcome = RetractOutcome::default();
        if let NodeKind::Leaf { items, .. } = &mut self.kind {
            for target in to_remove {
                if let Some(index) = items.iter().position(|i| i.id == target.id) {
                    outcome.removed.push(items.remove(index));
                }
            }
        }
        if self.config.notify_retract && !outcome.removed.is_empty() {
            let retracts: Vec<Element> = outcome
                .removed
                .iter()
                .map(|item| {
                    Element::builder("retract", ns::PUBSUB_EVENT)
                        .attr("id", &item.id)
                        .build()
                })
                .collect();
            let items_element = Element::builder("items", ns::PUBSUB_EVENT)
                .attr("node", &self.id)
                .append_all(retracts)
                .build();
            outcome.notifications = self.broadcast(service, items_element);
        }
        outcome
    }

    /// Clear the whole item history, notifying subscribers.
    pub fn purge_items(&mut self, service: &BareJid) -> (Vec<PublishedItem>, Vec<Element>) {
        let purged = match &mut self.kind {
            NodeKind::Leaf { items, .. } => std::mem::take(items),
            NodeKind::Collection { .. } => Vec::new(),
        };
        let notification = Element::builder("purge", ns::PUBSUB_EVENT)
            .attr("node", &self.id)
            .build();
        let notifications = self.broadcast(service, notification);
        (purged, notifications)
    }

    /// Deletion notifications for all subscribers, sent before the node
    /// is dropped from the service.
    pub fn delete_notifications(&self, service: &BareJid) -> Vec<Element> {
        if !self.config.notify_delete {
            return Vec::new();
        }
        let notification = Element::builder("delete", ns::PUBSUB_EVENT)
            .attr("node", &self.id)
            .build();
        self.broadcast(service, notification)
    }

    /// Plan item event messages per subscription.
    fn item_notifications(
        &self,
        items: &[PublishedItem],
        service: &BareJid,
        presences: &PresenceTracker,
    ) -> Vec<Element> {
        let presence_gated = self.config.access_model == AccessModel::Presence;
        let include_payload = self.config.deliver_payloads;
        let mut notifications = Vec::new();

        for subscription in &self.subscriptions {
            let admitted: Vec<&PublishedItem> = items
                .iter()
                .filter(|item| subscription.should_deliver(item, presence_gated, presences))
                .collect();
            if admitted.is_empty() {
                continue;
            }

            if subscription.options.digest {
                let items_element = Element::builder("items", ns::PUBSUB_EVENT)
                    .attr("node", &self.id)
                    .append_all(
                        admitted
                            .iter()
                            .map(|item| item.to_element(ns::PUBSUB_EVENT, include_payload)),
                    )
                    .build();
                let body = subscription.options.include_body.then(|| {
                    admitted
                        .iter()
                        .filter_map(|item| item.payload_text())
                        .collect::<Vec<_>>()
                        .join("\n")
                });
                notifications.push(event_message(
                    service,
                    &subscription.subscriber,
                    vec![items_element],
                    body,
                ));
            } else {
                for item in admitted {
                    let items_element = Element::builder("items", ns::PUBSUB_EVENT)
                        .attr("node", &self.id)
                        .append(item.to_element(ns::PUBSUB_EVENT, include_payload))
                        .build();
                    let body = subscription
                        .options
                        .include_body
                        .then(|| item.payload_text().unwrap_or_default());
                    notifications.push(event_message(
                        service,
                        &subscription.subscriber,
                        vec![items_element],
                        body,
                    ));
                }
            }
        }
        notifications
    }

    /// One event message per active, delivering subscription.
    fn broadcast(&self, service: &BareJid, child: Element) -> Vec<Element> {
        self.subscriptions
            .iter()
            .filter(|sub| sub.is_active() && sub.options.deliver)
            .map(|sub| event_message(service, &sub.subscriber, vec![child.clone()], None))
            .collect()
    }

    // ------------------------------------------------------------------
    // Children (collection nodes)
    // ------------------------------------------------------------------

    /// Register a child node id. No-op on leaves.
    pub fn add_child(&mut self, child_id: &str) {
        if let NodeKind::Collection { children } = &mut self.kind {
            children.insert(child_id.to_string());
        }
    }

    /// Drop a child node id.
    pub fn remove_child(&mut self, child_id: &str) {
        if let NodeKind::Collection { children } = &mut self.kind {
            children.remove(child_id);
        }
    }

    /// Ids of all children.
    pub fn children(&self) -> Vec<String> {
        match &self.kind {
            NodeKind::Collection { children } => children.iter().cloned().collect(),
            NodeKind::Leaf { .. } => Vec::new(),
        }
    }

    /// Whether the child node cap has been reached.
    pub fn is_max_leaf_reached(&self) -> bool {
        match (&self.kind, self.config.max_leaf_nodes) {
            (NodeKind::Collection { children }, Some(max)) => children.len() >= max,
            _ => false,
        }
    }

    /// Whether `jid` may associate a new child with this collection.
    pub fn association_allowed(&self, jid: &Jid) -> bool {
        match self.config.association_policy {
            AssociationPolicy::All => true,
            AssociationPolicy::Owners => self.is_owner(jid),
            AssociationPolicy::Whitelist => {
                self.is_owner(jid) || self.config.association_whitelist.contains(&jid.to_bare())
            }
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// The node configuration as a data form.
    pub fn config_form(&self, kind: FormKind) -> DataForm {
        self.config
            .to_form(kind, &self.owners(), self.is_collection())
    }

    /// Apply a submitted configuration form.
    ///
    /// The `pubsub#owner` field replaces the owner set; an update that
    /// would leave the node ownerless is rejected without any effect.
    pub fn configure(&mut self, form: &DataForm) -> Result<(), PubSubError> {
        if form.field("pubsub#owner").is_some() {
            let new_owners: Vec<BareJid> = form
                .values("pubsub#owner")
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect();
            if new_owners.is_empty() {
                return Err(PubSubError::not_acceptable());
            }
            let previous = self.owners();
            for owner in previous {
                if !new_owners.contains(&owner) {
                    self.affiliates.insert(owner, Affiliation::None);
                }
            }
            for owner in new_owners {
                self.affiliates.insert(owner, Affiliation::Owner);
            }
        }
        self.config.apply_form(form);
        Ok(())
    }
}

/// Build an event message from the service to a subscriber.
fn event_message(
    service: &BareJid,
    to: &Jid,
    children: Vec<Element>,
    body: Option<String>,
) -> Element {
    let event = Element::builder("event", ns::PUBSUB_EVENT)
        .append_all(children)
        .build();
    let mut builder = Element::builder("message", ns::JABBER_CLIENT)
        .attr("from", service.to_string())
        .attr("to", to.to_string())
        .append(event);
    if let Some(body) = body {
        builder = builder.append(Element::builder("body", ns::JABBER_CLIENT).append(body).build());
    }
    builder.build()
}
