//! Bridge to the host's ad-hoc command manager (XEP-0050).
//!
//! The engine does not interpret command payloads. IQs in the commands
//! namespace are handed to the host's manager; whatever it answers is
//! routed back to the sender.

use async_trait::async_trait;
use xmpp_parsers::iq::Iq;

use crate::error::PubSubError;

/// Host-provided ad-hoc command manager.
#[async_trait]
pub trait AdHocCommands: Send + Sync + 'static {
    /// Process a command IQ and produce the reply to route.
    async fn handle(&self, iq: &Iq) -> Iq;

    /// Release command session state at service shutdown.
    fn shutdown(&self) {}
}

/// Command manager for services without ad-hoc command support.
///
/// Answers every command with `feature-not-implemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommands;

#[async_trait]
impl AdHocCommands for NoCommands {
    async fn handle(&self, iq: &Iq) -> Iq {
        PubSubError {
            condition: xmpp_parsers::stanza_error::DefinedCondition::FeatureNotImplemented,
            error_type: xmpp_parsers::stanza_error::ErrorType::Cancel,
            detail: None,
        }
        .reply_to(iq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;
    use xmpp_parsers::iq::IqType;

    #[tokio::test]
    async fn test_no_commands_answers_feature_not_implemented() {
        let iq = Iq {
            from: Some("alice@example.com/desk".parse().expect("valid jid")),
            to: Some("pubsub.example.com".parse().expect("valid jid")),
            id: "cmd-1".to_string(),
            payload: IqType::Set(Element::bare("command", crate::ns::COMMANDS)),
        };

        let reply = NoCommands.handle(&iq).await;
        assert!(matches!(reply.payload, IqType::Error(_)));
        assert_eq!(reply.to, iq.from);
    }
}
