//! Error types and error reply construction.
//!
//! Every failing request is answered with a stanza error built from a base
//! condition (RFC 6120 section 8.3.3) plus, where XEP-0060 defines one, a
//! detail element in the `http://jabber.org/protocol/pubsub#errors`
//! namespace attached to the error.

use minidom::Element;
use thiserror::Error;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::ns;

/// Infrastructure errors surfaced by the service collaborators.
///
/// These never reach the requester as-is; request handling maps them to
/// stanza errors (usually `internal-server-error`) and the batcher retries
/// failed persistence operations instead of reporting them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A data form was structurally invalid.
    #[error("invalid data form: {0}")]
    InvalidForm(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a new backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Features named by `<unsupported/>` error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Publishing to this kind of node.
    Publish,
    /// Collection nodes.
    Collections,
    /// Item persistence.
    PersistentItems,
    /// Item retrieval from this kind of node.
    RetrieveItems,
    /// Purging this kind of node.
    PurgeNodes,
    /// Leaf nodes.
    LeafNodes,
}

impl Feature {
    /// The value carried in the `feature` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Publish => "publish",
            Feature::Collections => "collections",
            Feature::PersistentItems => "persistent-items",
            Feature::RetrieveItems => "retrieve-items",
            Feature::PurgeNodes => "purge-nodes",
            Feature::LeafNodes => "leaf",
        }
    }
}

/// XEP-0060 specific error details, carried as a child of the stanza
/// error element in the `#errors` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDetail {
    /// Request must name a node.
    NodeIdRequired,
    /// Request must name a JID.
    JidRequired,
    /// Request must carry a subscription id.
    SubidRequired,
    /// Sender and requested subscriber do not match.
    InvalidJid,
    /// The subscription id does not match an existing subscription.
    InvalidSubid,
    /// Request must include an item.
    ItemRequired,
    /// Node configuration does not accept items.
    ItemForbidden,
    /// Node configuration requires a payload.
    PayloadRequired,
    /// Item payload had more than one child element.
    InvalidPayload,
    /// The entity has no subscription to the node.
    NotSubscribed,
    /// Parent collection has reached its child node limit.
    MaxNodesExceeded,
    /// Whitelist node refused the subscription.
    ClosedNode,
    /// Presence access model refused the subscription.
    PresenceSubscriptionRequired,
    /// Roster access model refused the subscription.
    NotInRosterGroup,
    /// A subscription request is already awaiting approval.
    PendingSubscription,
    /// The named feature is not supported for this node or service.
    Unsupported(Feature),
}

impl ErrorDetail {
    fn element_name(&self) -> &'static str {
        match self {
            ErrorDetail::NodeIdRequired => "nodeid-required",
            ErrorDetail::JidRequired => "jid-required",
            ErrorDetail::SubidRequired => "subid-required",
            ErrorDetail::InvalidJid => "invalid-jid",
            ErrorDetail::InvalidSubid => "invalid-subid",
            ErrorDetail::ItemRequired => "item-required",
            ErrorDetail::ItemForbidden => "item-forbidden",
            ErrorDetail::PayloadRequired => "payload-required",
            ErrorDetail::InvalidPayload => "invalid-payload",
            ErrorDetail::NotSubscribed => "not-subscribed",
            ErrorDetail::MaxNodesExceeded => "max-nodes-exceeded",
            ErrorDetail::ClosedNode => "closed-node",
            ErrorDetail::PresenceSubscriptionRequired => "presence-subscription-required",
            ErrorDetail::NotInRosterGroup => "not-in-roster-group",
            ErrorDetail::PendingSubscription => "pending-subscription",
            ErrorDetail::Unsupported(_) => "unsupported",
        }
    }

    /// Build the `#errors` namespace element for this detail.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.element_name(), ns::PUBSUB_ERRORS);
        if let ErrorDetail::Unsupported(feature) = self {
            builder = builder.attr("feature", feature.as_str());
        }
        builder.build()
    }
}

/// A typed error reply for a PubSub request.
///
/// Pairs the base stanza error condition with an optional XEP-0060
/// detail. Handlers return this; the dispatcher turns it into an error
/// IQ and routes it back to the requester.
#[derive(Debug, Clone)]
pub struct PubSubError {
    /// Base RFC 6120 condition.
    pub condition: DefinedCondition,
    /// Error type attribute paired with the condition.
    pub error_type: ErrorType,
    /// Optional `#errors` namespace detail.
    pub detail: Option<ErrorDetail>,
}

impl PubSubError {
    fn new(condition: DefinedCondition, error_type: ErrorType) -> Self {
        Self {
            condition,
            error_type,
            detail: None,
        }
    }

    /// `bad-request`: malformed or unrecognized request.
    pub fn bad_request() -> Self {
        Self::new(DefinedCondition::BadRequest, ErrorType::Modify)
    }

    /// `item-not-found`: unknown node or item.
    pub fn item_not_found() -> Self {
        Self::new(DefinedCondition::ItemNotFound, ErrorType::Cancel)
    }

    /// `forbidden`: requester lacks the required affiliation or role.
    pub fn forbidden() -> Self {
        Self::new(DefinedCondition::Forbidden, ErrorType::Auth)
    }

    /// `not-allowed`: the operation is disabled by policy.
    pub fn not_allowed() -> Self {
        Self::new(DefinedCondition::NotAllowed, ErrorType::Cancel)
    }

    /// `not-acceptable`: the request is valid but the values are not.
    pub fn not_acceptable() -> Self {
        Self::new(DefinedCondition::NotAcceptable, ErrorType::Modify)
    }

    /// `not-authorized`: access model refused the requester.
    pub fn not_authorized() -> Self {
        Self::new(DefinedCondition::NotAuthorized, ErrorType::Auth)
    }

    /// `conflict`: duplicate node or subscription.
    pub fn conflict() -> Self {
        Self::new(DefinedCondition::Conflict, ErrorType::Cancel)
    }

    /// `unexpected-request`: operation invalid in the current state.
    pub fn unexpected_request() -> Self {
        Self::new(DefinedCondition::UnexpectedRequest, ErrorType::Cancel)
    }

    /// `feature-not-implemented` with the named feature detail.
    pub fn unsupported(feature: Feature) -> Self {
        Self::new(DefinedCondition::FeatureNotImplemented, ErrorType::Cancel)
            .with_detail(ErrorDetail::Unsupported(feature))
    }

    /// `internal-server-error`: collaborator failure.
    pub fn internal_server_error() -> Self {
        Self::new(DefinedCondition::InternalServerError, ErrorType::Wait)
    }

    /// Attach an `#errors` namespace detail to this error.
    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Build the stanza error element content for this error.
    pub fn to_stanza_error(&self) -> StanzaError {
        let mut error = StanzaError::new(self.error_type.clone(), self.condition.clone(), "en", "");
        error.other = self.detail.map(|d| d.to_element());
        error
    }

    /// Build an error IQ answering `iq`.
    pub fn reply_to(&self, iq: &Iq) -> Iq {
        Iq {
            from: iq.to.clone(),
            to: iq.from.clone(),
            id: iq.id.clone(),
            payload: IqType::Error(self.to_stanza_error()),
        }
    }

    /// Build an error IQ element answering `iq` that additionally carries
    /// `payload` beside the error element, a shape the typed IQ cannot
    /// express.
    pub fn reply_with_payload(&self, iq: &Iq, payload: Element) -> Element {
        let mut error = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", error_type_name(&self.error_type))
            .append(Element::builder(condition_name(&self.condition), ns::STANZAS).build());
        if let Some(detail) = self.detail {
            error = error.append(detail.to_element());
        }

        let mut reply = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "error")
            .attr("id", &iq.id);
        if let Some(to) = &iq.from {
            reply = reply.attr("to", to.to_string());
        }
        if let Some(from) = &iq.to {
            reply = reply.attr("from", from.to_string());
        }
        reply.append(payload).append(error.build()).build()
    }
}

fn error_type_name(error_type: &ErrorType) -> &'static str {
    match error_type {
        ErrorType::Auth => "auth",
        ErrorType::Cancel => "cancel",
        ErrorType::Continue => "continue",
        ErrorType::Modify => "modify",
        ErrorType::Wait => "wait",
    }
}

fn condition_name(condition: &DefinedCondition) -> &'static str {
    match condition {
        DefinedCondition::BadRequest => "bad-request",
        DefinedCondition::Conflict => "conflict",
        DefinedCondition::FeatureNotImplemented => "feature-not-implemented",
        DefinedCondition::Forbidden => "forbidden",
        DefinedCondition::InternalServerError => "internal-server-error",
        DefinedCondition::ItemNotFound => "item-not-found",
        DefinedCondition::NotAcceptable => "not-acceptable",
        DefinedCondition::NotAllowed => "not-allowed",
        DefinedCondition::NotAuthorized => "not-authorized",
        DefinedCondition::UnexpectedRequest => "unexpected-request",
        _ => "undefined-condition",
    }
}
