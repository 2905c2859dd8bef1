//! The PubSub engine: stanza dispatch and service lifecycle.
//!
//! One engine instance serves one PubSub address. The host feeds it every
//! IQ, presence, and message stanza addressed to the service; the engine
//! dispatches on the child element's namespace and name, runs the
//! operation against the node tree, and routes replies and event
//! notifications through the host's router.
//!
//! Dispatch is safe under parallel delivery: the node table is a sharded
//! concurrent map, every node carries its own lock, and notification
//! sends happen after the node lock is released.

mod items;
mod nodes;
mod subscriptions;

use std::collections::HashSet;
use std::sync::Arc;

use jid::BareJid;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::batcher::ItemBatcher;
use crate::backend::PubSubBackend;
use crate::commands::AdHocCommands;
use crate::error::PubSubError;
use crate::forms::{DataForm, FormKind, FORM_TYPE_SUBSCRIBE_AUTHORIZATION};
use crate::ns;
use crate::presence::PresenceTracker;
use crate::registry::NodeRegistry;
use crate::router::{Router, Stanza};
use crate::service::{Clock, ServiceConfig, ServiceContext, UserDirectory};

/// The PubSub protocol engine.
pub struct PubSubEngine {
    config: ServiceConfig,
    router: Arc<dyn Router>,
    users: Arc<dyn UserDirectory>,
    backend: Arc<dyn PubSubBackend>,
    commands: Arc<dyn AdHocCommands>,
    clock: Arc<dyn Clock>,
    nodes: NodeRegistry,
    presences: PresenceTracker,
    batcher: Arc<ItemBatcher>,
}

impl PubSubEngine {
    /// Create an engine from the host-provided context.
    pub fn new(context: ServiceContext) -> Self {
        let ServiceContext {
            config,
            router,
            users,
            backend,
            commands,
            clock,
        } = context;
        let nodes = NodeRegistry::new(&config.address, config.collection_nodes_supported);
        let presences = PresenceTracker::new();
        let batcher = Arc::new(ItemBatcher::new(
            Arc::clone(&backend),
            config.flush_interval,
            config.flush_batch_size,
        ));
        Self {
            config,
            router,
            users,
            backend,
            commands,
            clock,
            nodes,
            presences,
            batcher,
        }
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The node registry.
    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// The presence tracker.
    pub fn presences(&self) -> &PresenceTracker {
        &self.presences
    }

    /// The item persistence batcher.
    pub fn batcher(&self) -> &Arc<ItemBatcher> {
        &self.batcher
    }

    /// Bring the service up: load stored nodes, probe the presence of
    /// presence-gated subscribers, and start the persistence worker.
    pub async fn start(&self) {
        match self.backend.load_nodes().await {
            Ok(stored) => {
                for node in stored {
                    let _ = self.nodes.insert_if_absent(node);
                }
            }
            Err(error) => warn!(error = %error, "loading stored nodes failed"),
        }

        let mut to_probe: HashSet<BareJid> = HashSet::new();
        for handle in self.nodes.all() {
            let node = handle.read().await;
            for subscriber in node.presence_based_subscribers() {
                to_probe.insert(subscriber.to_bare());
            }
        }
        for jid in to_probe {
            let mut probe = Presence::new(PresenceType::Probe);
            probe.from = Some(self.config.address.clone().into());
            probe.to = Some(jid.into());
            self.router.route(Stanza::Presence(probe));
        }

        self.batcher.spawn();
        info!(service = %self.config.address, nodes = self.nodes.len(), "pubsub engine started");
    }

    /// Change the persistence flush period, rescheduling the worker.
    pub fn set_flush_interval(&self, period: std::time::Duration) {
        self.batcher.set_flush_interval(period);
    }

    /// Shut the service down: stop the persistence worker, drain the
    /// queues once, and release ad-hoc command state.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
        self.commands.shutdown();
        info!(service = %self.config.address, "pubsub engine stopped");
    }

    /// Handle an IQ addressed to the service.
    ///
    /// Answers whether the engine consumed the stanza; disco and other
    /// unrecognized namespaces stay with the caller.
    #[instrument(skip(self, iq), fields(id = %iq.id, from = ?iq.from))]
    pub async fn handle_iq(&self, iq: &Iq) -> bool {
        let (child, is_get) = match &iq.payload {
            // Results and errors addressed to the service carry nothing to act on.
            IqType::Result(_) | IqType::Error(_) => return true,
            IqType::Get(element) => (element, true),
            IqType::Set(element) => (element, false),
        };

        if child.ns() == ns::PUBSUB {
            let result = if let Some(action) = child.get_child("publish", ns::PUBSUB) {
                self.publish(iq, action).await
            } else if let Some(action) = child.get_child("subscribe", ns::PUBSUB) {
                self.subscribe(iq, child, action).await
            } else if let Some(action) = child.get_child("options", ns::PUBSUB) {
                if is_get {
                    self.subscription_options_get(iq, action).await
                } else {
                    self.subscription_options_set(iq, action).await
                }
            } else if let Some(action) = child.get_child("create", ns::PUBSUB) {
                self.create_node(iq, child, action).await
            } else if let Some(action) = child.get_child("unsubscribe", ns::PUBSUB) {
                self.unsubscribe(iq, action).await
            } else if child.get_child("subscriptions", ns::PUBSUB).is_some() {
                self.user_subscriptions(iq).await
            } else if child.get_child("affiliations", ns::PUBSUB).is_some() {
                self.user_affiliations(iq).await
            } else if let Some(action) = child.get_child("items", ns::PUBSUB) {
                self.retrieve_items(iq, action).await
            } else if let Some(action) = child.get_child("retract", ns::PUBSUB) {
                self.retract_items(iq, action).await
            } else {
                debug!("unknown pubsub action");
                Err(PubSubError::bad_request())
            };
            self.respond(iq, result);
            return true;
        }

        if child.ns() == ns::PUBSUB_OWNER {
            let result = if let Some(action) = child.get_child("configure", ns::PUBSUB_OWNER) {
                if is_get {
                    self.node_config_get(iq, action).await
                } else {
                    self.node_config_set(iq, action).await
                }
            } else if let Some(action) = child.get_child("default", ns::PUBSUB_OWNER) {
                self.default_node_config(iq, action).await
            } else if let Some(action) = child.get_child("delete", ns::PUBSUB_OWNER) {
                self.delete_node(iq, action).await
            } else if let Some(action) = child.get_child("entities", ns::PUBSUB_OWNER) {
                if is_get {
                    self.affiliated_entities(iq, action).await
                } else {
                    self.modify_affiliations(iq, action).await
                }
            } else if let Some(action) = child.get_child("purge", ns::PUBSUB_OWNER) {
                self.purge_node(iq, action).await
            } else {
                debug!("unknown pubsub#owner action");
                Err(PubSubError::bad_request())
            };
            self.respond(iq, result);
            return true;
        }

        if child.ns() == ns::COMMANDS {
            let reply = self.commands.handle(iq).await;
            self.router.route(Stanza::Iq(reply));
            return true;
        }

        false
    }

    /// Handle a presence addressed to the service. Only available and
    /// unavailable presences matter; subscription negotiation stays with
    /// the server.
    pub fn handle_presence(&self, presence: &Presence) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        match presence.type_ {
            PresenceType::None => {
                if let Ok(full) = from.try_into_full() {
                    self.presences.available(&full, presence.show.clone());
                }
            }
            PresenceType::Unavailable => {
                if let Ok(full) = from.try_into_full() {
                    self.presences.unavailable(&full);
                }
            }
            _ => {}
        }
    }

    /// Handle a message addressed to the service: bounced notifications
    /// and answers to subscription authorization requests.
    pub async fn handle_message(&self, message: &Message) {
        match message.type_ {
            MessageType::Error => {
                let error_type = message
                    .payloads
                    .iter()
                    .find(|payload| payload.name() == "error")
                    .and_then(|error| error.attr("type"));
                match error_type {
                    Some("cancel") => {
                        // The subscriber's address bounced for good; drop
                        // every subscription it holds on the service.
                        if let Some(from) = &message.from {
                            self.cancel_all_subscriptions(&from.to_bare()).await;
                        }
                    }
                    Some("auth") => {
                        debug!("auth error bounce ignored");
                    }
                    _ => {}
                }
            }
            MessageType::Normal => {
                for payload in &message.payloads {
                    if let Some(form) = DataForm::from_element(payload) {
                        if form.kind == FormKind::Submit
                            && form.form_type() == Some(FORM_TYPE_SUBSCRIBE_AUTHORIZATION)
                        {
                            self.authorization_answer(&form).await;
                            break;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Drop every subscription `user` holds, on every node.
    pub async fn cancel_all_subscriptions(&self, user: &BareJid) {
        for handle in self.nodes.all() {
            let mut node = handle.write().await;
            let node_id = node.id().to_string();
            let sub_ids: Vec<String> = node
                .subscriptions_for(user)
                .iter()
                .map(|sub| sub.id.clone())
                .collect();
            for sub_id in sub_ids {
                if node.cancel_subscription(&sub_id).is_some() {
                    if let Err(error) = self.backend.remove_subscription(&node_id, &sub_id).await {
                        warn!(error = %error, node = %node_id, "removing subscription failed");
                    }
                }
            }
            if node.affiliation_of(user).is_none() {
                if let Err(error) = self.backend.remove_affiliation(&node_id, user).await {
                    warn!(error = %error, node = %node_id, "removing affiliation failed");
                }
            }
        }
        debug!(user = %user, "cancelled all subscriptions");
    }

    /// Ask for the user's presence when no resource is known yet.
    ///
    /// Presence-gated delivery is useless without presence data; the
    /// user's server answers with current presence once subscribed.
    pub(crate) fn request_presence_subscription(&self, user: &BareJid) -> Option<Stanza> {
        if self.presences.is_online(user) {
            return None;
        }
        let mut subscribe = Presence::new(PresenceType::Subscribe);
        subscribe.from = Some(self.config.address.clone().into());
        subscribe.to = Some(user.clone().into());
        Some(Stanza::Presence(subscribe))
    }

    /// Give up the presence subscription when no node needs it anymore.
    pub(crate) async fn release_presence_subscription(&self, user: &BareJid) {
        for handle in self.nodes.all() {
            if handle.read().await.is_presence_based_delivery(user) {
                return;
            }
        }
        let mut unsubscribe = Presence::new(PresenceType::Unsubscribe);
        unsubscribe.from = Some(self.config.address.clone().into());
        unsubscribe.to = Some(user.clone().into());
        self.router.route(Stanza::Presence(unsubscribe));
    }

    /// Route a handler's stanzas, or the error reply on refusal.
    fn respond(&self, iq: &Iq, result: Result<Vec<Stanza>, PubSubError>) {
        match result {
            Ok(stanzas) => {
                for stanza in stanzas {
                    self.router.route(stanza);
                }
            }
            Err(error) => {
                debug!(condition = ?error.condition, "request refused");
                self.router.route(Stanza::Iq(error.reply_to(iq)));
            }
        }
    }

    /// The sender of an IQ, which transports guarantee for routed stanzas.
    pub(crate) fn sender(iq: &Iq) -> Result<jid::Jid, PubSubError> {
        iq.from.clone().ok_or_else(PubSubError::bad_request)
    }
}
