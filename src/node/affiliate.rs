//! Affiliations of entities with a node.

use jid::BareJid;
use minidom::Element;

use crate::types::Affiliation;

/// An entity's long-lived relationship with one node.
///
/// Keyed by bare JID; the subscriptions of the same entity are tracked
/// separately on the node because one affiliate may hold several
/// subscriptions when the node allows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAffiliate {
    /// Bare JID of the entity.
    pub jid: BareJid,
    /// Relationship with the node.
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    /// Create an affiliate record.
    pub fn new(jid: BareJid, affiliation: Affiliation) -> Self {
        Self { jid, affiliation }
    }

    /// Build an `affiliation` element for affiliation listings.
    pub fn to_element(&self, ns: &str, node_id: Option<&str>) -> Element {
        let mut builder = Element::builder("affiliation", ns)
            .attr("jid", self.jid.to_string())
            .attr("affiliation", self.affiliation.to_string());
        if let Some(node_id) = node_id {
            builder = builder.attr("node", node_id);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_element() {
        let affiliate = NodeAffiliate::new(
            "alice@example.com".parse().expect("valid jid"),
            Affiliation::Publisher,
        );

        let elem = affiliate.to_element(crate::ns::PUBSUB, Some("/blog"));
        assert_eq!(elem.attr("jid"), Some("alice@example.com"));
        assert_eq!(elem.attr("affiliation"), Some("publisher"));
        assert_eq!(elem.attr("node"), Some("/blog"));
    }

    #[test]
    fn test_root_node_omits_node_attribute() {
        let affiliate = NodeAffiliate::new(
            "alice@example.com".parse().expect("valid jid"),
            Affiliation::Owner,
        );

        let elem = affiliate.to_element(crate::ns::PUBSUB, None);
        assert_eq!(elem.attr("node"), None);
    }
}
