//! Node management: creation, configuration, deletion, and the owner's
//! affiliated-entities surface.

use jid::{BareJid, Jid};
use minidom::Element;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};
use xmpp_parsers::iq::Iq;

use crate::error::{ErrorDetail, Feature, PubSubError};
use crate::forms::sent_configuration_form;
use crate::forms::FormKind;
use crate::node::{Node, NodeAffiliate, NodeSubscription};
use crate::ns;
use crate::registry::NodeHandle;
use crate::router::{result_iq, result_iq_with, Stanza};
use crate::service::ROOT_NODE_ID;
use crate::types::Affiliation;

use super::PubSubEngine;

/// Length of generated instant node ids.
const INSTANT_NODE_ID_LEN: usize = 15;

fn random_node_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INSTANT_NODE_ID_LEN)
        .map(char::from)
        .collect()
}

impl PubSubEngine {
    /// Whether `actor` may administer the node: owner or service admin.
    fn is_node_admin(&self, node: &Node, actor: &Jid) -> bool {
        node.is_owner(actor) || self.config.is_admin(actor)
    }

    /// Resolve the node id of an owner-namespace request. A missing node
    /// attribute is only valid when a service admin addresses the root
    /// collection.
    fn resolve_owner_node_id(&self, iq: &Iq, action: &Element) -> Result<String, PubSubError> {
        if let Some(node_id) = action.attr("node") {
            return Ok(node_id.to_string());
        }
        let from = Self::sender(iq)?;
        if self.config.is_admin(&from) && self.nodes.root().is_some() {
            Ok(ROOT_NODE_ID.to_string())
        } else {
            Err(PubSubError::bad_request().with_detail(ErrorDetail::NodeIdRequired))
        }
    }

    /// Create a node.
    pub(crate) async fn create_node(
        &self,
        iq: &Iq,
        child: &Element,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let from = Self::sender(iq)?;
        if !self.config.can_create_node(&from) || !self.users.is_registered(&from.to_bare()) {
            return Err(PubSubError::forbidden());
        }

        let requested = action.attr("node").map(String::from);
        let mut new_id = match requested.clone() {
            Some(node_id) => node_id,
            None => {
                if !self.config.instant_nodes_supported {
                    return Err(
                        PubSubError::not_acceptable().with_detail(ErrorDetail::NodeIdRequired)
                    );
                }
                // Collisions with existing nodes are unlikely but real.
                loop {
                    let node_id = random_node_id();
                    if !self.nodes.contains(&node_id) {
                        break node_id;
                    }
                }
            }
        };

        let completed_form = child
            .get_child("configure", ns::PUBSUB)
            .and_then(sent_configuration_form);

        // A submitted pubsub#collection field names the parent; otherwise
        // new nodes hang off the root collection when there is one.
        let mut parent: Option<(String, NodeHandle)> = None;
        if let Some(form) = &completed_form {
            if let Some(parent_id) = form.value("pubsub#collection") {
                if !parent_id.is_empty() {
                    let handle = self
                        .nodes
                        .get(parent_id)
                        .ok_or_else(PubSubError::item_not_found)?;
                    if !handle.read().await.is_collection() {
                        return Err(PubSubError::not_acceptable());
                    }
                    if !new_id.starts_with(parent_id) {
                        new_id = format!("{}/{}", parent_id, new_id);
                    }
                    parent = Some((parent_id.to_string(), handle));
                }
            }
        }
        if parent.is_none() {
            if let Some(root) = self.nodes.root() {
                if !new_id.starts_with('/') {
                    new_id = format!("{}/{}", ROOT_NODE_ID, new_id);
                }
                parent = Some((ROOT_NODE_ID.to_string(), root));
            }
        }

        if self.nodes.contains(&new_id) {
            return Err(PubSubError::conflict());
        }

        let collection_type = action.attr("type") == Some("collection");
        if collection_type && !self.config.collection_nodes_supported {
            return Err(PubSubError::unsupported(Feature::Collections));
        }

        if let Some((_, parent_handle)) = &parent {
            if !collection_type {
                let parent_node = parent_handle.read().await;
                if !parent_node.is_root() {
                    if !parent_node.association_allowed(&from) {
                        return Err(PubSubError::forbidden());
                    }
                    if parent_node.is_max_leaf_reached() {
                        return Err(
                            PubSubError::conflict().with_detail(ErrorDetail::MaxNodesExceeded)
                        );
                    }
                }
            }
        }

        let owner = from.to_bare();
        let config = self
            .nodes
            .default_config(collection_type)
            .ok_or_else(|| PubSubError::unsupported(Feature::Collections))?;
        let parent_id = parent.as_ref().map(|(parent_id, _)| parent_id.clone());
        let mut node = if collection_type {
            Node::new_collection(new_id.clone(), parent_id, owner.clone(), config)
        } else {
            Node::new_leaf(new_id.clone(), parent_id, owner.clone(), config)
        };
        node.set_affiliation(owner.clone(), Affiliation::Owner);
        if let Some(form) = &completed_form {
            node.configure(form)?;
        }

        // The registry entry is the authoritative check: a racing create
        // for the same id loses here and answers conflict.
        let handle = self
            .nodes
            .insert_if_absent(node)
            .map_err(|_| PubSubError::conflict())?;
        if let Some((_, parent_handle)) = &parent {
            parent_handle.write().await.add_child(&new_id);
        }

        {
            let node = handle.read().await;
            if let Err(error) = self.backend.save_node(&node).await {
                warn!(error = %error, node = %new_id, "saving node failed");
            }
        }
        debug!(node = %new_id, creator = %owner, collection = collection_type, "node created");

        // Echo the assigned id when it differs from the request.
        let reply = if requested.as_deref() == Some(new_id.as_str()) {
            result_iq(iq)
        } else {
            let create = Element::builder("create", ns::PUBSUB)
                .attr("node", &new_id)
                .build();
            let pubsub = Element::builder("pubsub", ns::PUBSUB).append(create).build();
            result_iq_with(iq, Some(pubsub))
        };
        Ok(vec![Stanza::Iq(reply)])
    }

    /// Answer a node's configuration form to its owner.
    pub(crate) async fn node_config_get(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = self.resolve_owner_node_id(iq, action)?;
        let handle = self
            .nodes
            .get(&node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let node = handle.read().await;
        if !self.is_node_admin(&node, &from) {
            return Err(PubSubError::forbidden());
        }

        let mut configure = Element::builder("configure", ns::PUBSUB_OWNER)
            .append(node.config_form(FormKind::Form).to_element());
        if let Some(node_id) = node.listed_id() {
            configure = configure.attr("node", node_id);
        }
        let pubsub = Element::builder("pubsub", ns::PUBSUB_OWNER)
            .append(configure.build())
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Apply a submitted node configuration form.
    pub(crate) async fn node_config_set(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = self.resolve_owner_node_id(iq, action)?;
        let handle = self
            .nodes
            .get(&node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;
        let form = sent_configuration_form(action).ok_or_else(PubSubError::bad_request)?;

        let mut node = handle.write().await;
        if !self.is_node_admin(&node, &from) {
            return Err(PubSubError::forbidden());
        }
        node.configure(&form)?;
        if let Err(error) = self.backend.save_node(&node).await {
            warn!(error = %error, node = %node_id, "saving node failed");
        }
        Ok(vec![Stanza::Iq(result_iq(iq))])
    }

    /// Answer the service default configuration for a node kind.
    pub(crate) async fn default_node_config(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let requested_type = action.attr("type").unwrap_or("leaf");
        let is_collection = requested_type == "collection";
        let config = self.nodes.default_config(is_collection).ok_or_else(|| {
            PubSubError::unsupported(if is_collection {
                Feature::Collections
            } else {
                Feature::LeafNodes
            })
        })?;

        let default = Element::builder("default", ns::PUBSUB_OWNER)
            .append(config.to_default_form_element(is_collection))
            .build();
        let pubsub = Element::builder("pubsub", ns::PUBSUB_OWNER)
            .append(default)
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Delete a node, notifying its subscribers.
    pub(crate) async fn delete_node(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action.attr("node").ok_or_else(PubSubError::bad_request)?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let node = handle.read().await;
        if !self.is_node_admin(&node, &from) {
            return Err(PubSubError::forbidden());
        }
        if node.is_root() {
            return Err(PubSubError::not_allowed());
        }
        let notifications = node.delete_notifications(&self.config.address);
        let items = node.published_items().to_vec();
        let parent_id = node.parent().map(str::to_string);
        drop(node);

        if let Err(error) = self.backend.delete_node(node_id).await {
            warn!(error = %error, node = %node_id, "deleting node failed");
            return Err(PubSubError::internal_server_error());
        }

        self.nodes.remove(node_id);
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get(&parent_id) {
                parent.write().await.remove_child(node_id);
            }
        }
        // The node's storage rows are gone; forget any queued item writes.
        self.batcher.cancel_items(&items);
        debug!(node = %node_id, "node deleted");

        let mut stanzas = vec![Stanza::Iq(result_iq(iq))];
        stanzas.extend(notifications.into_iter().map(Stanza::Message));
        Ok(stanzas)
    }

    /// Answer the affiliated entities of a node to its owner.
    pub(crate) async fn affiliated_entities(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action.attr("node").ok_or_else(PubSubError::bad_request)?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let node = handle.read().await;
        if !self.is_node_admin(&node, &from) {
            return Err(PubSubError::forbidden());
        }

        let entities = Self::entities_element(&node, node.affiliates().iter().map(|a| &a.jid));
        let pubsub = Element::builder("pubsub", ns::PUBSUB_OWNER)
            .append(entities)
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Apply affiliation and subscription changes for a batch of entities.
    ///
    /// Entities whose change would remove the only owner are skipped and
    /// reported back with their unchanged state; changes to the other
    /// entities still take effect.
    pub(crate) async fn modify_affiliations(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action.attr("node").ok_or_else(PubSubError::bad_request)?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let mut invalid: Vec<BareJid> = Vec::new();
        let mut saved_affiliations: Vec<NodeAffiliate> = Vec::new();
        let mut saved_subscriptions: Vec<NodeSubscription> = Vec::new();
        let mut removed_subscriptions: Vec<String> = Vec::new();
        let mut notifications: Vec<Element> = Vec::new();
        let reply;

        {
            let mut node = handle.write().await;
            if !self.is_node_admin(&node, &from) {
                return Err(PubSubError::forbidden());
            }

            for entity in action.children().filter(|c| c.name() == "entity") {
                let Some(subscriber) = entity.attr("jid").and_then(|jid| jid.parse::<Jid>().ok())
                else {
                    warn!(node = %node_id, "entity without usable jid ignored");
                    continue;
                };
                let owner = subscriber.to_bare();

                if let Some(new_affiliation) = entity.attr("affiliation") {
                    let current = node.affiliation_of(&owner);
                    if let Some(current) = current {
                        if current.to_string() != new_affiliation
                            && current == Affiliation::Owner
                            && node.owners().len() == 1
                        {
                            // Refusing to orphan the node; reported below.
                            invalid.push(owner.clone());
                            continue;
                        }
                    }
                    let affiliation = match new_affiliation {
                        "owner" => Affiliation::Owner,
                        "publisher" => Affiliation::Publisher,
                        "none" => Affiliation::None,
                        _ => Affiliation::Outcast,
                    };
                    node.set_affiliation(owner.clone(), affiliation);
                    saved_affiliations.push(NodeAffiliate::new(owner.clone(), affiliation));
                }

                if let Some(sub_status) = entity.attr("subscription") {
                    let existing = if node.config().multiple_subscriptions {
                        entity
                            .attr("subid")
                            .and_then(|sub_id| node.subscription_by_id(sub_id))
                            .cloned()
                    } else {
                        node.subscription_of(&subscriber).cloned()
                    };
                    match (sub_status, existing) {
                        ("none", Some(subscription)) => {
                            node.cancel_subscription(&subscription.id);
                            removed_subscriptions.push(subscription.id);
                        }
                        ("subscribed", Some(subscription)) => {
                            if let Some(notification) = node.approve_subscription(
                                &subscription.id,
                                true,
                                &self.config.address,
                            ) {
                                notifications.push(notification);
                            }
                            if let Some(updated) = node.subscription_by_id(&subscription.id) {
                                saved_subscriptions.push(updated.clone());
                            }
                        }
                        ("subscribed", None) => {
                            let subscription = node.create_subscription(
                                owner.clone(),
                                subscriber.clone(),
                                false,
                                None,
                            );
                            saved_subscriptions.push(subscription);
                        }
                        _ => {}
                    }
                }
            }

            reply = if invalid.is_empty() {
                Stanza::Iq(result_iq(iq))
            } else {
                // Answer with the pre-change state of the refused entities.
                let entities = Self::entities_element(&node, invalid.iter());
                let pubsub = Element::builder("pubsub", ns::PUBSUB_OWNER)
                    .append(entities)
                    .build();
                Stanza::Raw(PubSubError::not_acceptable().reply_with_payload(iq, pubsub))
            };
        }

        for affiliate in &saved_affiliations {
            if let Err(error) = self.backend.save_affiliation(node_id, affiliate).await {
                warn!(error = %error, node = %node_id, "saving affiliation failed");
            }
        }
        for subscription in &saved_subscriptions {
            if let Err(error) = self.backend.save_subscription(node_id, subscription).await {
                warn!(error = %error, node = %node_id, "saving subscription failed");
            }
        }
        for sub_id in &removed_subscriptions {
            if let Err(error) = self.backend.remove_subscription(node_id, sub_id).await {
                warn!(error = %error, node = %node_id, "removing subscription failed");
            }
        }

        let mut stanzas = vec![reply];
        stanzas.extend(notifications.into_iter().map(Stanza::Message));
        Ok(stanzas)
    }

    /// Build an `entities` element describing the given JIDs as the node
    /// currently sees them.
    fn entities_element<'a>(
        node: &Node,
        jids: impl Iterator<Item = &'a BareJid>,
    ) -> Element {
        let mut entity_elements: Vec<Element> = Vec::new();
        for jid in jids {
            let affiliation = node.affiliation_of(jid).unwrap_or_default();
            let subscriptions = node.subscriptions_for(jid);
            if subscriptions.is_empty() {
                entity_elements.push(
                    Element::builder("entity", ns::PUBSUB_OWNER)
                        .attr("jid", jid.to_string())
                        .attr("affiliation", affiliation.to_string())
                        .attr("subscription", "none")
                        .build(),
                );
            } else {
                for subscription in subscriptions {
                    let mut entity = Element::builder("entity", ns::PUBSUB_OWNER)
                        .attr("jid", subscription.subscriber.to_string())
                        .attr("affiliation", affiliation.to_string())
                        .attr("subscription", subscription.state.to_string());
                    if node.config().multiple_subscriptions {
                        entity = entity.attr("subid", &subscription.id);
                    }
                    entity_elements.push(entity.build());
                }
            }
        }

        let mut entities = Element::builder("entities", ns::PUBSUB_OWNER);
        if let Some(node_id) = node.listed_id() {
            entities = entities.attr("node", node_id);
        }
        entities.append_all(entity_elements).build()
    }
}
