//! # xmpp-pubsub
//!
//! Embeddable publish-subscribe engine (XEP-0060) for XMPP servers.
//!
//! The crate implements the protocol state machine of a PubSub service:
//! node management, affiliations, the subscription lifecycle including
//! owner authorization, item publication with bounded history, and
//! presence-gated event fan-out. It is designed to be embedded in a
//! server the way a component plugs into a host:
//!
//! - **Inbound**: the host feeds every IQ, presence, and message stanza
//!   addressed to the service into [`PubSubEngine`].
//! - **Outbound**: replies and notifications go through the host's
//!   [`Router`], which owns queueing and delivery.
//! - **Durability**: node, affiliation, and subscription writes hit the
//!   host's [`PubSubBackend`] on the request path; item writes are
//!   batched by a background worker and retried until they stick.
//!
//! ## Architecture
//!
//! - **Dispatch**: namespace and action of the first child element select
//!   the handler; unknown actions in a known namespace answer
//!   `bad-request`, unknown namespaces stay with the caller.
//! - **Node tree**: a concurrent registry of nodes, each behind its own
//!   lock. Mutation and notification planning run under the node lock;
//!   sends happen after it is released.
//! - **Presence side-channel**: available/unavailable presences feed a
//!   tracker that presence-gated delivery consults per resource.
//!
//! ## Out of scope
//!
//! Stream parsing, TLS and SASL, rosters, disco, and connection
//! management belong to the host server.

pub mod access;
pub mod backend;
pub mod batcher;
pub mod commands;
pub mod engine;
pub mod forms;
pub mod node;
pub mod presence;
pub mod registry;
pub mod router;
pub mod service;

mod error;
mod types;

pub use access::AccessModel;
pub use backend::{InMemoryBackend, PubSubBackend};
pub use batcher::ItemBatcher;
pub use commands::{AdHocCommands, NoCommands};
pub use engine::PubSubEngine;
pub use error::{EngineError, ErrorDetail, Feature, PubSubError};
pub use forms::{
    DataForm, Field, FormKind, FORM_TYPE_NODE_CONFIG, FORM_TYPE_SUBSCRIBE_AUTHORIZATION,
    FORM_TYPE_SUBSCRIBE_OPTIONS,
};
pub use node::{
    AssociationPolicy, Node, NodeAffiliate, NodeConfig, NodeSubscription, PublishedItem,
    SubscriptionDepth, SubscriptionOptions,
};
pub use presence::PresenceTracker;
pub use registry::{NodeHandle, NodeRegistry};
pub use router::{result_iq, result_iq_with, Router, Stanza};
pub use service::{
    Clock, ServiceConfig, ServiceContext, SystemClock, UserDirectory, ROOT_NODE_ID,
};
pub use types::{Affiliation, PublisherModel, SubscriptionState, SubscriptionType};

/// XML namespaces the engine speaks.
pub mod ns {
    /// XMPP client stanza namespace.
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stanza error condition namespace.
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Main PubSub namespace (XEP-0060).
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    /// PubSub owner namespace for node management.
    pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
    /// PubSub event namespace for notifications.
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    /// PubSub error detail namespace.
    pub const PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";
    /// Ad-hoc commands namespace (XEP-0050).
    pub const COMMANDS: &str = "http://jabber.org/protocol/commands";
    /// Data forms namespace (XEP-0004).
    pub const DATA_FORMS: &str = "jabber:x:data";
}
