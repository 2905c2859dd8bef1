//! Item operations: publish, retract, retrieve, purge.

use minidom::Element;
use tracing::warn;
use xmpp_parsers::iq::Iq;

use crate::error::{ErrorDetail, Feature, PubSubError};
use crate::node::PublishedItem;
use crate::ns;
use crate::router::{result_iq, result_iq_with, Stanza};
use crate::types::Affiliation;

use super::PubSubEngine;

impl PubSubEngine {
    /// Publish items to a leaf node and fan out notifications.
    pub(crate) async fn publish(&self, iq: &Iq, action: &Element) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action
            .attr("node")
            .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::NodeIdRequired))?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let mut node = handle.write().await;
        if !node.can_publish(&from) && !self.config.is_admin(&from) {
            return Err(PubSubError::forbidden());
        }
        if node.is_collection() {
            return Err(PubSubError::unsupported(Feature::Publish));
        }

        let items: Vec<&Element> = action.children().filter(|c| c.name() == "item").collect();
        let item_required = node.config().item_required();
        if items.is_empty() && item_required {
            return Err(PubSubError::bad_request().with_detail(ErrorDetail::ItemRequired));
        }
        if !items.is_empty() && !item_required {
            return Err(PubSubError::bad_request().with_detail(ErrorDetail::ItemForbidden));
        }
        for item in &items {
            let payload_count = item.children().count();
            if payload_count == 0 && node.config().deliver_payloads {
                return Err(PubSubError::bad_request().with_detail(ErrorDetail::PayloadRequired));
            }
            if payload_count > 1 {
                return Err(PubSubError::bad_request().with_detail(ErrorDetail::InvalidPayload));
            }
        }

        let outcome = node.publish_items(
            &from,
            &items,
            self.clock.now(),
            &self.config.address,
            &self.presences,
        );
        let persist = node.config().persist_items;
        drop(node);

        // The publisher's result goes out before any event notification.
        let mut stanzas = vec![Stanza::Iq(result_iq(iq))];
        stanzas.extend(outcome.notifications.into_iter().map(Stanza::Message));

        if persist {
            for item in outcome.new_items {
                self.batcher.queue_add(item);
            }
            for item in outcome.expired {
                self.batcher.queue_remove(item);
            }
        }
        Ok(stanzas)
    }

    /// Retract named items from a leaf node.
    ///
    /// Every named item must exist and be deletable by the sender; any
    /// failed check refuses the whole request.
    pub(crate) async fn retract_items(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action
            .attr("node")
            .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::NodeIdRequired))?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;

        let item_elements: Vec<&Element> =
            action.children().filter(|c| c.name() == "item").collect();
        if item_elements.is_empty() {
            return Err(PubSubError::bad_request().with_detail(ErrorDetail::ItemRequired));
        }

        let mut node = handle.write().await;
        if node.is_collection() || !node.config().item_required() {
            return Err(PubSubError::unsupported(Feature::PersistentItems));
        }

        let owners = node.owner_set();
        let is_admin = self.config.is_admin(&from);
        let mut targets: Vec<PublishedItem> = Vec::new();
        for element in item_elements {
            let item_id = element
                .attr("id")
                .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::ItemRequired))?;
            let item = node
                .published_item(item_id)
                .ok_or_else(PubSubError::item_not_found)?;
            if !item.can_delete(&from, &owners) && !is_admin {
                return Err(PubSubError::forbidden());
            }
            targets.push(item.clone());
        }

        let outcome = node.delete_items(&targets, &self.config.address);
        let persist = node.config().persist_items;
        drop(node);

        let mut stanzas = vec![Stanza::Iq(result_iq(iq))];
        stanzas.extend(outcome.notifications.into_iter().map(Stanza::Message));
        if persist {
            for item in outcome.removed {
                self.batcher.queue_remove(item);
            }
        }
        Ok(stanzas)
    }

    /// Answer the items of a leaf node, subject to access and
    /// subscription checks.
    pub(crate) async fn retrieve_items(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let node_id = action
            .attr("node")
            .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::NodeIdRequired))?;
        let handle = self
            .nodes
            .get(node_id)
            .ok_or_else(PubSubError::item_not_found)?;
        let from = Self::sender(iq)?;
        let owner = from.to_bare();

        let node = handle.read().await;
        if node.is_collection() {
            return Err(PubSubError::unsupported(Feature::RetrieveItems));
        }

        let access = node.config().access_model;
        if !access.can_access_items(&node, &owner, &from, self.users.as_ref()) {
            return Err(access.refusal());
        }
        if node.affiliation_of(&owner) == Some(Affiliation::Outcast) {
            return Err(PubSubError::forbidden());
        }

        let subscription = if node.config().multiple_subscriptions {
            let sub_id = action
                .attr("subid")
                .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::SubidRequired))?;
            let subscription = node.subscription_by_id(sub_id).ok_or_else(|| {
                PubSubError::not_acceptable().with_detail(ErrorDetail::InvalidSubid)
            })?;
            Some(subscription)
        } else {
            None
        };
        if let Some(subscription) = subscription {
            if !subscription.is_active() {
                return Err(
                    PubSubError::not_authorized().with_detail(ErrorDetail::NotSubscribed)
                );
            }
        }

        let max_items = match action.attr("max_items") {
            Some(value) => match value.parse::<usize>() {
                Ok(count) => Some(count),
                Err(_) => {
                    warn!(node = %node_id, max_items = %value, "unparseable max_items, answering all items");
                    None
                }
            },
            None => None,
        };

        let mut force_payload = false;
        let mut items: Vec<&PublishedItem> = if let Some(count) = max_items {
            node.recent_items(count)
        } else {
            let requested_ids: Vec<&str> = action
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|c| c.attr("id"))
                .collect();
            if requested_ids.is_empty() {
                node.published_items().iter().collect()
            } else {
                // Explicitly requested items always carry their payload.
                force_payload = true;
                requested_ids
                    .iter()
                    .filter_map(|id| node.published_item(id))
                    .collect()
            }
        };

        if let Some(subscription) = subscription {
            if subscription.options.keyword.is_some() {
                items.retain(|item| subscription.matches_keyword(item));
            }
        }

        let include_payload = force_payload || node.config().deliver_payloads;
        let items_element = Element::builder("items", ns::PUBSUB)
            .attr("node", node_id)
            .append_all(
                items
                    .iter()
                    .map(|item| item.to_element(ns::PUBSUB, include_payload)),
            )
            .build();
        let pubsub = Element::builder("pubsub", ns::PUBSUB)
            .append(items_element)
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Clear the item history of a persistent leaf node.
    pub(crate) async fn purge_node(
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

        let mut node = handle.write().await;
        if !node.is_owner(&from) && !self.config.is_admin(&from) {
            return Err(PubSubError::forbidden());
        }
        if node.is_collection() {
            return Err(PubSubError::unsupported(Feature::PurgeNodes));
        }
        if !node.config().persist_items {
            return Err(PubSubError::unsupported(Feature::PersistentItems));
        }

        let (purged, notifications) = node.purge_items(&self.config.address);
        drop(node);

        let mut stanzas = vec![Stanza::Iq(result_iq(iq))];
        stanzas.extend(notifications.into_iter().map(Stanza::Message));
        for item in purged {
            self.batcher.queue_remove(item);
        }
        Ok(stanzas)
    }
}
