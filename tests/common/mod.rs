//! Test fixtures for driving the engine through whole stanza exchanges.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use jid::BareJid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::stanza_error::DefinedCondition;

use xmpp_pubsub::{
    InMemoryBackend, NoCommands, PubSubEngine, Router, ServiceConfig, ServiceContext, Stanza,
    SystemClock, UserDirectory,
};

/// Router that records every stanza instead of delivering it.
#[derive(Default)]
pub struct RecordingRouter {
    sent: Mutex<Vec<Stanza>>,
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything routed since the last call.
    pub fn take(&self) -> Vec<Stanza> {
        std::mem::take(&mut *self.sent.lock().expect("router lock"))
    }
}

impl Router for RecordingRouter {
    fn route(&self, stanza: Stanza) {
        self.sent.lock().expect("router lock").push(stanza);
    }
}

/// Directory with test-controlled registration, presence subscriptions,
/// and roster groups.
#[derive(Default)]
pub struct StaticDirectory {
    unregistered: Mutex<HashSet<BareJid>>,
    presence_pairs: Mutex<HashSet<(BareJid, BareJid)>>,
    groups: Mutex<HashMap<(BareJid, BareJid), Vec<String>>>,
}

impl StaticDirectory {
    pub fn mark_unregistered(&self, user: &str) {
        self.unregistered
            .lock()
            .expect("directory lock")
            .insert(user.parse().expect("valid jid"));
    }

    pub fn add_presence_subscription(&self, owner: &str, user: &str) {
        self.presence_pairs.lock().expect("directory lock").insert((
            owner.parse().expect("valid jid"),
            user.parse().expect("valid jid"),
        ));
    }

    pub fn add_roster_group(&self, owner: &str, user: &str, group: &str) {
        self.groups
            .lock()
            .expect("directory lock")
            .entry((
                owner.parse().expect("valid jid"),
                user.parse().expect("valid jid"),
            ))
            .or_default()
            .push(group.to_string());
    }
}

impl UserDirectory for StaticDirectory {
    fn is_registered(&self, user: &BareJid) -> bool {
        !self.unregistered.lock().expect("directory lock").contains(user)
    }

    fn has_presence_subscription(&self, owner: &BareJid, user: &BareJid) -> bool {
        self.presence_pairs
            .lock()
            .expect("directory lock")
            .contains(&(owner.clone(), user.clone()))
    }

    fn roster_groups(&self, owner: &BareJid, user: &BareJid) -> Vec<String> {
        self.groups
            .lock()
            .expect("directory lock")
            .get(&(owner.clone(), user.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

/// An engine wired to recording collaborators.
pub struct TestHarness {
    pub engine: Arc<PubSubEngine>,
    pub router: Arc<RecordingRouter>,
    pub backend: Arc<InMemoryBackend>,
    pub directory: Arc<StaticDirectory>,
}

impl TestHarness {
    /// Engine for `pubsub.example.com` with `admin@example.com` as
    /// service admin and every user registered.
    pub fn new() -> Self {
        let router = Arc::new(RecordingRouter::new());
        let backend = Arc::new(InMemoryBackend::new());
        let directory = Arc::new(StaticDirectory::default());
        let config = ServiceConfig::new("pubsub.example.com".parse().expect("valid jid"))
            .with_admin("admin@example.com".parse().expect("valid jid"));
        let engine = Arc::new(PubSubEngine::new(ServiceContext {
            config,
            router: Arc::clone(&router) as Arc<dyn Router>,
            users: Arc::clone(&directory) as Arc<dyn UserDirectory>,
            backend: Arc::clone(&backend) as Arc<dyn xmpp_pubsub::PubSubBackend>,
            commands: Arc::new(NoCommands),
            clock: Arc::new(SystemClock),
        }));
        Self {
            engine,
            router,
            backend,
            directory,
        }
    }

    /// Feed an IQ (given as XML) through the engine and collect what it
    /// routed in response.
    pub async fn send_iq(&self, xml: &str) -> Vec<Stanza> {
        let element: Element = xml.parse().expect("valid XML");
        let iq = Iq::try_from(element).expect("valid IQ");
        assert!(self.engine.handle_iq(&iq).await, "IQ should be handled");
        self.router.take()
    }

    /// Feed a message (given as XML) through the engine.
    pub async fn send_message(&self, xml: &str) -> Vec<Stanza> {
        let element: Element = xml.parse().expect("valid XML");
        let message = Message::try_from(element).expect("valid message");
        self.engine.handle_message(&message).await;
        self.router.take()
    }

    /// Record an available presence for `full_jid`.
    pub fn available(&self, full_jid: &str, show: Option<xmpp_parsers::presence::Show>) {
        use xmpp_parsers::presence::{Presence, Type};
        let mut presence = Presence::new(Type::None);
        presence.from = Some(full_jid.parse().expect("valid jid"));
        presence.show = show;
        self.engine.handle_presence(&presence);
    }

    /// Record an unavailable presence for `full_jid`.
    pub fn unavailable(&self, full_jid: &str) {
        use xmpp_parsers::presence::{Presence, Type};
        let mut presence = Presence::new(Type::Unavailable);
        presence.from = Some(full_jid.parse().expect("valid jid"));
        self.engine.handle_presence(&presence);
    }

    /// Create the `/blog` leaf owned by alice.
    pub async fn create_blog(&self) {
        let stanzas = self
            .send_iq(
                "<iq xmlns='jabber:client' type='set' from='alice@example.com/desk' \
                     to='pubsub.example.com' id='create-blog'>\
                   <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
                     <create node='blog'/>\
                   </pubsub>\
                 </iq>",
            )
            .await;
        assert!(find_result(&stanzas).is_some(), "create should succeed");
    }

    /// Reconfigure `/blog` with one form field, as alice.
    pub async fn configure_blog(&self, var: &str, value: &str) {
        let stanzas = self
            .send_iq(&format!(
                "<iq xmlns='jabber:client' type='set' from='alice@example.com/desk' \
                     to='pubsub.example.com' id='cfg'>\
                   <pubsub xmlns='http://jabber.org/protocol/pubsub#owner'>\
                     <configure node='/blog'>\
                       <x xmlns='jabber:x:data' type='submit'>\
                         <field var='FORM_TYPE' type='hidden'>\
                           <value>http://jabber.org/protocol/pubsub#node_config</value>\
                         </field>\
                         <field var='{}'><value>{}</value></field>\
                       </x>\
                     </configure>\
                   </pubsub>\
                 </iq>",
                var, value
            ))
            .await;
        assert!(find_result(&stanzas).is_some(), "configure should succeed");
    }

    /// Subscribe `jid` to `/blog` from the same bare JID and answer the
    /// reported subscription state.
    pub async fn subscribe_blog(&self, jid: &str) -> (Vec<Stanza>, String) {
        let stanzas = self
            .send_iq(&format!(
                "<iq xmlns='jabber:client' type='set' from='{jid}' \
                     to='pubsub.example.com' id='sub'>\
                   <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
                     <subscribe node='/blog' jid='{jid}'/>\
                   </pubsub>\
                 </iq>",
            ))
            .await;
        let state = subscription_state(&stanzas).expect("subscription state in reply");
        (stanzas, state)
    }

    /// Publish one `<entry>` payload to `/blog` as `publisher`.
    pub async fn publish_blog(&self, publisher: &str, text: &str) -> Vec<Stanza> {
        self.publish_blog_item(publisher, None, text).await
    }

    /// Publish one `<entry>` payload with an explicit item id.
    pub async fn publish_blog_item(
        &self,
        publisher: &str,
        item_id: Option<&str>,
        text: &str,
    ) -> Vec<Stanza> {
        let id_attr = item_id.map(|id| format!(" id='{}'", id)).unwrap_or_default();
        self.send_iq(&format!(
            "<iq xmlns='jabber:client' type='set' from='{publisher}' \
                 to='pubsub.example.com' id='pub'>\
               <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
                 <publish node='/blog'>\
                   <item{id_attr}><entry xmlns='urn:example:entry'>{text}</entry></item>\
                 </publish>\
               </pubsub>\
             </iq>",
        ))
        .await
    }
}

/// First result IQ among the routed stanzas.
pub fn find_result(stanzas: &[Stanza]) -> Option<&Iq> {
    stanzas.iter().find_map(|stanza| match stanza {
        Stanza::Iq(iq) if matches!(iq.payload, IqType::Result(_)) => Some(iq),
        _ => None,
    })
}

/// Error condition of the first error IQ among the routed stanzas.
pub fn error_condition(stanzas: &[Stanza]) -> Option<DefinedCondition> {
    stanzas.iter().find_map(|stanza| match stanza {
        Stanza::Iq(iq) => match &iq.payload {
            IqType::Error(error) => Some(error.defined_condition.clone()),
            _ => None,
        },
        _ => None,
    })
}

/// Name of the pubsub `#errors` detail on the first error IQ.
pub fn error_detail(stanzas: &[Stanza]) -> Option<String> {
    stanzas.iter().find_map(|stanza| match stanza {
        Stanza::Iq(iq) => match &iq.payload {
            IqType::Error(error) => error.other.as_ref().map(|detail| detail.name().to_string()),
            _ => None,
        },
        _ => None,
    })
}

/// Event notification messages among the routed stanzas.
pub fn event_messages(stanzas: &[Stanza]) -> Vec<&Element> {
    stanzas
        .iter()
        .filter_map(|stanza| match stanza {
            Stanza::Message(message)
                if message
                    .get_child("event", "http://jabber.org/protocol/pubsub#event")
                    .is_some() =>
            {
                Some(message)
            }
            _ => None,
        })
        .collect()
}

/// Subscription state attribute in a subscribe result.
pub fn subscription_state(stanzas: &[Stanza]) -> Option<String> {
    find_result(stanzas).and_then(|iq| match &iq.payload {
        IqType::Result(Some(pubsub)) => pubsub
            .get_child("subscription", "http://jabber.org/protocol/pubsub")
            .and_then(|sub| sub.attr("subscription"))
            .map(String::from),
        _ => None,
    })
}

/// Subscription id attribute in a subscribe result, when reported.
pub fn subscription_id(stanzas: &[Stanza]) -> Option<String> {
    find_result(stanzas).and_then(|iq| match &iq.payload {
        IqType::Result(Some(pubsub)) => pubsub
            .get_child("subscription", "http://jabber.org/protocol/pubsub")
            .and_then(|sub| sub.attr("subid"))
            .map(String::from),
        _ => None,
    })
}
