//! Outbound stanza routing contract.
//!
//! The engine never talks to sockets. Every reply and notification is
//! handed to the host's router, which owns queueing and delivery; routing
//! is fire-and-forget and must not block. Delivery failures come back as
//! inbound error stanzas, not as return values.

use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence::Presence;

/// An outbound stanza emitted by the engine.
///
/// Event notification messages are built directly as elements; IQ replies
/// and presences keep their typed form.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// An IQ result or error.
    Iq(Iq),
    /// A message, usually an event notification.
    Message(Element),
    /// A presence, used for probes and subscription management.
    Presence(Presence),
    /// A pre-assembled IQ element, for replies the typed form cannot
    /// express (an error IQ that also carries a payload).
    Raw(Element),
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

/// Host-provided stanza router.
///
/// `route` must be non-blocking; implementations typically push onto an
/// internal queue.
pub trait Router: Send + Sync + 'static {
    /// Queue a stanza for delivery.
    fn route(&self, stanza: Stanza);
}

/// Build an empty result IQ answering `iq`.
pub fn result_iq(iq: &Iq) -> Iq {
    result_iq_with(iq, None)
}

/// Build a result IQ answering `iq` with an optional payload element.
pub fn result_iq_with(iq: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: iq.to.clone(),
        to: iq.from.clone(),
        id: iq.id.clone(),
        payload: IqType::Result(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn test_result_iq_swaps_addresses() {
        let iq = Iq {
            from: Some("alice@example.com/desk".parse().expect("valid jid")),
            to: Some("pubsub.example.com".parse().expect("valid jid")),
            id: "x1".to_string(),
            payload: IqType::Set(Element::bare("pubsub", ns::PUBSUB)),
        };

        let reply = result_iq(&iq);
        assert_eq!(reply.from, iq.to);
        assert_eq!(reply.to, iq.from);
        assert_eq!(reply.id, "x1");
        assert!(matches!(reply.payload, IqType::Result(None)));
    }
}
