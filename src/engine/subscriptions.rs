//! Subscription lifecycle: subscribe, unsubscribe, options, per-user
//! listings, and the owner authorization flow.

use jid::Jid;
use minidom::Element;
use tracing::{debug, warn};
use xmpp_parsers::iq::Iq;

use crate::access::AccessModel;
use crate::error::{ErrorDetail, PubSubError};
use crate::forms::{DataForm, FormKind};
use crate::node::{Node, NodeAffiliate, NodeSubscription, SubscriptionOptions};
use crate::ns;
use crate::registry::NodeHandle;
use crate::router::{result_iq, result_iq_with, Stanza};
use crate::types::{Affiliation, SubscriptionType};

use super::PubSubEngine;

impl PubSubEngine {
    /// Resolve the node named by the action, falling back to the root
    /// collection when the service supports one.
    fn node_or_root(&self, action: &Element) -> Result<NodeHandle, PubSubError> {
        match action.attr("node") {
            Some(node_id) => self
                .nodes
                .get(node_id)
                .ok_or_else(PubSubError::item_not_found),
            None => self.nodes.root().ok_or_else(|| {
                PubSubError::bad_request().with_detail(ErrorDetail::NodeIdRequired)
            }),
        }
    }

    /// Find the subscription a request refers to: by `subid` when the
    /// node allows multiple subscriptions, by `jid` otherwise.
    fn locate_subscription(
        node: &Node,
        action: &Element,
    ) -> Result<NodeSubscription, PubSubError> {
        if node.config().multiple_subscriptions {
            let sub_id = action
                .attr("subid")
                .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::SubidRequired))?;
            node.subscription_by_id(sub_id).cloned().ok_or_else(|| {
                PubSubError::not_acceptable().with_detail(ErrorDetail::InvalidSubid)
            })
        } else {
            let jid_attr = action
                .attr("jid")
                .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::JidRequired))?;
            let subscriber: Jid = jid_attr
                .parse()
                .map_err(|_| PubSubError::bad_request().with_detail(ErrorDetail::InvalidJid))?;
            node.subscription_of(&subscriber).cloned().ok_or_else(|| {
                PubSubError::unexpected_request().with_detail(ErrorDetail::NotSubscribed)
            })
        }
    }

    /// Result IQ echoing the state of a subscription.
    fn subscription_state_reply(iq: &Iq, node: &Node, subscription: &NodeSubscription) -> Stanza {
        let element = subscription.to_element(
            ns::PUBSUB,
            node.listed_id(),
            node.config().multiple_subscriptions,
        );
        let pubsub = Element::builder("pubsub", ns::PUBSUB).append(element).build();
        Stanza::Iq(result_iq_with(iq, Some(pubsub)))
    }

    /// Subscribe the sender (or an admin-designated JID) to a node.
    pub(crate) async fn subscribe(
        &self,
        iq: &Iq,
        child: &Element,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let handle = self.node_or_root(action)?;
        let from = Self::sender(iq)?;

        let subscriber: Jid = action
            .attr("jid")
            .ok_or_else(|| PubSubError::bad_request().with_detail(ErrorDetail::InvalidJid))?
            .parse()
            .map_err(|_| PubSubError::bad_request().with_detail(ErrorDetail::InvalidJid))?;
        if from.to_bare() != subscriber.to_bare() && !self.config.is_admin(&from) {
            return Err(PubSubError::bad_request().with_detail(ErrorDetail::InvalidJid));
        }
        let owner = subscriber.to_bare();

        let mut node = handle.write().await;
        let access = node.config().access_model;
        if !access.can_subscribe(&node, &owner, &subscriber, self.users.as_ref()) {
            return Err(access.refusal());
        }
        if !self.users.is_registered(&owner) {
            return Err(PubSubError::forbidden());
        }
        if node.affiliation_of(&owner) == Some(Affiliation::Outcast) {
            return Err(PubSubError::forbidden());
        }
        if !node.config().subscription_enabled && !self.config.is_admin(&from) {
            return Err(PubSubError::not_allowed());
        }

        let options_form = child
            .get_child("options", ns::PUBSUB)
            .and_then(DataForm::find_in);
        let mut options = options_form
            .as_ref()
            .map(SubscriptionOptions::from_form)
            .unwrap_or_default();

        if !node.is_collection() && !node.config().multiple_subscriptions {
            if let Some(existing) = node.subscription_of(&subscriber) {
                // Already subscribed; echo the current state instead of
                // stacking another subscription.
                return Ok(vec![Self::subscription_state_reply(iq, &node, existing)]);
            }
        }

        if node.is_collection() {
            // Collection subscriptions default to node events unless the
            // options form asked for items.
            let typed_explicitly = options_form
                .as_ref()
                .and_then(|form| form.value("pubsub#subscription_type"))
                .is_some();
            if !typed_explicitly {
                options.subscription_type = SubscriptionType::Nodes;
            }
            for existing in node.subscriptions_for(&owner) {
                match options.subscription_type {
                    SubscriptionType::Nodes
                        if existing.options.subscription_type == SubscriptionType::Nodes =>
                    {
                        return Err(PubSubError::conflict());
                    }
                    SubscriptionType::Items
                        if existing.options.subscription_type == SubscriptionType::Items
                            && !node.config().multiple_subscriptions =>
                    {
                        return Ok(vec![Self::subscription_state_reply(iq, &node, existing)]);
                    }
                    _ => {}
                }
            }
        }

        let pending = access.authorization_required();
        let subscription =
            node.create_subscription(owner.clone(), subscriber.clone(), pending, Some(options));

        let mut stanzas = vec![Self::subscription_state_reply(iq, &node, &subscription)];
        if pending {
            for request in node.authorization_requests(&subscription, &self.config.address) {
                stanzas.push(Stanza::Message(request));
            }
        }

        let node_id = node.id().to_string();
        let affiliation = node.affiliation_of(&owner).unwrap_or(Affiliation::Member);
        let presence_gated = node.config().access_model == AccessModel::Presence
            || subscription.options.presence_based_delivery();
        drop(node);

        if let Err(error) = self.backend.save_subscription(&node_id, &subscription).await {
            warn!(error = %error, node = %node_id, "saving subscription failed");
        }
        let affiliate = NodeAffiliate::new(owner.clone(), affiliation);
        if let Err(error) = self.backend.save_affiliation(&node_id, &affiliate).await {
            warn!(error = %error, node = %node_id, "saving affiliation failed");
        }
        if presence_gated {
            if let Some(probe) = self.request_presence_subscription(&owner) {
                stanzas.push(probe);
            }
        }
        Ok(stanzas)
    }

    /// Cancel a subscription.
    pub(crate) async fn unsubscribe(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let handle = self.node_or_root(action)?;
        let from = Self::sender(iq)?;

        let mut node = handle.write().await;
        let subscription = Self::locate_subscription(&node, action)?;
        if !node.config().subscription_enabled && !self.config.is_admin(&from) {
            return Err(PubSubError::not_allowed());
        }
        if !subscription.can_modify(&from) && !self.config.is_admin(&from) {
            return Err(PubSubError::forbidden());
        }

        node.cancel_subscription(&subscription.id);
        let node_id = node.id().to_string();
        let affiliation_dropped = node.affiliation_of(&subscription.owner).is_none();
        drop(node);

        if let Err(error) = self
            .backend
            .remove_subscription(&node_id, &subscription.id)
            .await
        {
            warn!(error = %error, node = %node_id, "removing subscription failed");
        }
        if affiliation_dropped {
            if let Err(error) = self
                .backend
                .remove_affiliation(&node_id, &subscription.owner)
                .await
            {
                warn!(error = %error, node = %node_id, "removing affiliation failed");
            }
        }
        if subscription.options.presence_based_delivery() {
            self.release_presence_subscription(&subscription.owner).await;
        }
        Ok(vec![Stanza::Iq(result_iq(iq))])
    }

    /// Answer a subscription's configuration form.
    pub(crate) async fn subscription_options_get(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let handle = self.node_or_root(action)?;
        let from = Self::sender(iq)?;

        let node = handle.read().await;
        let subscription = Self::locate_subscription(&node, action)?;
        if !subscription.can_modify(&from) {
            return Err(PubSubError::forbidden());
        }

        let mut options = Element::builder("options", ns::PUBSUB)
            .attr("jid", subscription.subscriber.to_string())
            .append(subscription.options.to_form(FormKind::Form).to_element());
        if let Some(node_id) = node.listed_id() {
            options = options.attr("node", node_id);
        }
        if node.config().multiple_subscriptions {
            options = options.attr("subid", &subscription.id);
        }
        let pubsub = Element::builder("pubsub", ns::PUBSUB)
            .append(options.build())
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Apply a submitted subscription options form.
    pub(crate) async fn subscription_options_set(
        &self,
        iq: &Iq,
        action: &Element,
    ) -> Result<Vec<Stanza>, PubSubError> {
        let handle = self.node_or_root(action)?;
        let from = Self::sender(iq)?;
        let form = DataForm::find_in(action).ok_or_else(PubSubError::bad_request)?;

        let mut node = handle.write().await;
        let located = Self::locate_subscription(&node, action)?;
        if !located.can_modify(&from) {
            return Err(PubSubError::forbidden());
        }

        let node_id = node.id().to_string();
        let updated = node
            .apply_subscription_options(&located.id, &form)
            .ok_or_else(|| PubSubError::not_acceptable().with_detail(ErrorDetail::InvalidSubid))?;
        drop(node);

        if let Err(error) = self.backend.save_subscription(&node_id, &updated).await {
            warn!(error = %error, node = %node_id, "saving subscription failed");
        }
        Ok(vec![Stanza::Iq(result_iq(iq))])
    }

    /// List every subscription the sender holds across the service.
    pub(crate) async fn user_subscriptions(&self, iq: &Iq) -> Result<Vec<Stanza>, PubSubError> {
        let owner = Self::sender(iq)?.to_bare();
        let mut entries: Vec<Element> = Vec::new();

        for handle in self.nodes.all() {
            let node = handle.read().await;
            let affiliation = node.affiliation_of(&owner).unwrap_or_default();
            for subscription in node.subscriptions_for(&owner) {
                let mut entry = Element::builder("subscription", ns::PUBSUB)
                    .attr("jid", subscription.subscriber.to_string())
                    .attr("affiliation", affiliation.to_string())
                    .attr("subscription", subscription.state.to_string());
                if let Some(node_id) = node.listed_id() {
                    entry = entry.attr("node", node_id);
                }
                if node.config().multiple_subscriptions {
                    entry = entry.attr("subid", &subscription.id);
                }
                entries.push(entry.build());
            }
        }

        if entries.is_empty() {
            return Err(PubSubError::item_not_found());
        }
        let subscriptions = Element::builder("subscriptions", ns::PUBSUB)
            .append_all(entries)
            .build();
        let pubsub = Element::builder("pubsub", ns::PUBSUB)
            .append(subscriptions)
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// List every affiliation the sender holds across the service.
    pub(crate) async fn user_affiliations(&self, iq: &Iq) -> Result<Vec<Stanza>, PubSubError> {
        let owner = Self::sender(iq)?.to_bare();
        let mut entries: Vec<Element> = Vec::new();

        for handle in self.nodes.all() {
            let node = handle.read().await;
            if let Some(affiliation) = node.affiliation_of(&owner) {
                let affiliate = NodeAffiliate::new(owner.clone(), affiliation);
                entries.push(affiliate.to_element(ns::PUBSUB, node.listed_id()));
            }
        }

        if entries.is_empty() {
            return Err(PubSubError::item_not_found());
        }
        let affiliations = Element::builder("affiliations", ns::PUBSUB)
            .append_all(entries)
            .build();
        let pubsub = Element::builder("pubsub", ns::PUBSUB)
            .append(affiliations)
            .build();
        Ok(vec![Stanza::Iq(result_iq_with(iq, Some(pubsub)))])
    }

    /// Apply an owner's answer to a subscription authorization form.
    ///
    /// Malformed forms are logged and dropped; the owner gets no reply
    /// either way.
    pub(crate) async fn authorization_answer(&self, form: &DataForm) {
        let Some(node_id) = form.value("pubsub#node") else {
            warn!("authorization answer without node field");
            return;
        };
        let Some(sub_id) = form.value("pubsub#subid") else {
            warn!(node = %node_id, "authorization answer without subid field");
            return;
        };
        let approved = match form.value("pubsub#allow") {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            other => {
                warn!(allow = ?other, "invalid allow value in authorization answer");
                return;
            }
        };

        let Some(handle) = self.nodes.get(node_id) else {
            debug!(node = %node_id, "authorization answer for unknown node");
            return;
        };
        let mut node = handle.write().await;
        let Some(notification) =
            node.approve_subscription(sub_id, approved, &self.config.address)
        else {
            debug!(node = %node_id, subid = %sub_id, "authorization answer for unknown subscription");
            return;
        };
        let remaining = node.subscription_by_id(sub_id).cloned();
        drop(node);

        match remaining {
            Some(subscription) => {
                if let Err(error) = self.backend.save_subscription(node_id, &subscription).await {
                    warn!(error = %error, node = %node_id, "saving subscription failed");
                }
            }
            None => {
                if let Err(error) = self.backend.remove_subscription(node_id, sub_id).await {
                    warn!(error = %error, node = %node_id, "removing subscription failed");
                }
            }
        }
        self.router.route(Stanza::Message(notification));
    }
}
