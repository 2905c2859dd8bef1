//! Published items held by leaf nodes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;

/// An item published to a leaf node.
///
/// Items are immutable snapshots; publishing with an existing id replaces
/// the whole item. Identity is `(node, id)`, which is also what the
/// persistence queues compare when cancelling pending writes.
#[derive(Debug, Clone)]
pub struct PublishedItem {
    /// Id of the node holding the item.
    pub node_id: String,
    /// Item id, unique within the node.
    pub id: String,
    /// Who published the item.
    pub publisher: Jid,
    /// Payload element, if one was sent.
    pub payload: Option<Element>,
    /// When the item was published.
    pub published_at: DateTime<Utc>,
}

impl PartialEq for PublishedItem {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.id == other.id
    }
}

impl Eq for PublishedItem {}

impl PublishedItem {
    /// Whether `deleter` may retract this item: the original publisher or
    /// a node owner. Service admins are cleared by the caller.
    pub fn can_delete(&self, deleter: &Jid, owners: &HashSet<BareJid>) -> bool {
        let deleter_bare = deleter.to_bare();
        deleter_bare == self.publisher.to_bare() || owners.contains(&deleter_bare)
    }

    /// Whether the serialized payload contains `keyword`.
    ///
    /// Items without payload never match.
    pub fn matches_keyword(&self, keyword: &str) -> bool {
        self.payload
            .as_ref()
            .map(|p| String::from(p).contains(keyword))
            .unwrap_or(false)
    }

    /// Build an `item` element, with the payload included when requested.
    pub fn to_element(&self, ns: &str, include_payload: bool) -> Element {
        let mut builder = Element::builder("item", ns).attr("id", &self.id);
        if include_payload {
            if let Some(ref payload) = self.payload {
                builder = builder.append(payload.clone());
            }
        }
        builder.build()
    }

    /// Text content of the payload, used for `include_body` delivery.
    pub fn payload_text(&self) -> Option<String> {
        self.payload.as_ref().map(|p| p.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(node: &str, id: &str, publisher: &str, payload: Option<&str>) -> PublishedItem {
        PublishedItem {
            node_id: node.to_string(),
            id: id.to_string(),
            publisher: publisher.parse().expect("valid jid"),
            payload: payload.map(|xml| xml.parse().expect("valid XML")),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_identity_ignores_payload() {
        let a = item("/blog", "i1", "alice@example.com", Some("<a xmlns='x'/>"));
        let b = item("/blog", "i1", "bob@example.com", None);
        let c = item("/blog", "i2", "alice@example.com", None);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_can_delete_publisher_and_owner() {
        let owners: HashSet<BareJid> =
            std::iter::once("alice@example.com".parse().expect("valid jid")).collect();
        let item = item("/blog", "i1", "bob@example.com/r1", None);

        assert!(item.can_delete(&"bob@example.com/r2".parse().expect("valid jid"), &owners));
        assert!(item.can_delete(&"alice@example.com".parse().expect("valid jid"), &owners));
        assert!(!item.can_delete(&"carol@example.com".parse().expect("valid jid"), &owners));
    }

    #[test]
    fn test_keyword_match_on_payload() {
        let with = item("/blog", "i1", "a@x.com", Some("<entry xmlns='e'>rust news</entry>"));
        let without = item("/blog", "i2", "a@x.com", None);

        assert!(with.matches_keyword("rust"));
        assert!(!with.matches_keyword("cooking"));
        assert!(!without.matches_keyword("rust"));
    }

    #[test]
    fn test_to_element_payload_toggle() {
        let item = item("/blog", "i1", "a@x.com", Some("<entry xmlns='e'>hi</entry>"));

        let bare = item.to_element(crate::ns::PUBSUB, false);
        assert_eq!(bare.attr("id"), Some("i1"));
        assert_eq!(bare.children().count(), 0);

        let full = item.to_element(crate::ns::PUBSUB, true);
        assert_eq!(full.children().count(), 1);
    }
}
