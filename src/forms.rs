//! XEP-0004 data forms as used by node and subscription configuration.
//!
//! Only the subset the PubSub protocol needs: submit/form/result kinds,
//! flat fields with one or more values, and the `FORM_TYPE` convention.
//! Also normalizes the configuration short-form (an `access` attribute
//! plus optional `group` children on `<configure/>`) into a regular
//! submitted form so the rest of the engine only ever sees data forms.

use minidom::Element;
use tracing::debug;

use crate::ns;

/// `FORM_TYPE` value of node configuration forms.
pub const FORM_TYPE_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

/// `FORM_TYPE` value of subscription authorization forms.
pub const FORM_TYPE_SUBSCRIBE_AUTHORIZATION: &str =
    "http://jabber.org/protocol/pubsub#subscribe_authorization";

/// `FORM_TYPE` value of subscription options forms.
pub const FORM_TYPE_SUBSCRIBE_OPTIONS: &str =
    "http://jabber.org/protocol/pubsub#subscribe_options";

/// Data form kind (the `type` attribute of the `x` element).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormKind {
    /// A form offered for filling out.
    Form,
    /// A completed form.
    #[default]
    Submit,
    /// Cancellation of a form.
    Cancel,
    /// Form data in a result.
    Result,
}

impl FormKind {
    fn as_str(&self) -> &'static str {
        match self {
            FormKind::Form => "form",
            FormKind::Submit => "submit",
            FormKind::Cancel => "cancel",
            FormKind::Result => "result",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "form" => Some(FormKind::Form),
            "submit" => Some(FormKind::Submit),
            "cancel" => Some(FormKind::Cancel),
            "result" => Some(FormKind::Result),
            _ => None,
        }
    }
}

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field variable name (`var` attribute).
    pub var: String,
    /// Field type, e.g. `hidden`, `boolean`, `list-single`.
    pub field_type: Option<String>,
    /// Field values in document order.
    pub values: Vec<String>,
}

impl Field {
    /// Create a field with a single value.
    pub fn new(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            field_type: None,
            values: vec![value.into()],
        }
    }

    /// First value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

/// A parsed XEP-0004 data form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataForm {
    /// Form kind.
    pub kind: FormKind,
    /// Fields in document order.
    pub fields: Vec<Field>,
}

impl DataForm {
    /// Create an empty form of the given kind.
    pub fn new(kind: FormKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    /// Parse a form from an `x` element in the `jabber:x:data` namespace.
    ///
    /// Returns `None` when the element is not a data form.
    pub fn from_element(elem: &Element) -> Option<Self> {
        if elem.name() != "x" || elem.ns() != ns::DATA_FORMS {
            return None;
        }
        let kind = elem.attr("type").and_then(FormKind::from_str)?;

        let fields = elem
            .children()
            .filter(|c| c.name() == "field")
            .filter_map(|field| {
                let var = field.attr("var")?.to_string();
                let values = field
                    .children()
                    .filter(|c| c.name() == "value")
                    .map(|v| v.text())
                    .collect();
                Some(Field {
                    var,
                    field_type: field.attr("type").map(String::from),
                    values,
                })
            })
            .collect();

        Some(Self { kind, fields })
    }

    /// Look for a data form among the direct children of `parent`.
    pub fn find_in(parent: &Element) -> Option<Self> {
        parent
            .get_child("x", ns::DATA_FORMS)
            .and_then(Self::from_element)
    }

    /// Serialize the form back to an `x` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("x", ns::DATA_FORMS).attr("type", self.kind.as_str());
        for field in &self.fields {
            let mut field_builder = Element::builder("field", ns::DATA_FORMS).attr("var", &field.var);
            if let Some(ref field_type) = field.field_type {
                field_builder = field_builder.attr("type", field_type.as_str());
            }
            for value in &field.values {
                field_builder = field_builder
                    .append(Element::builder("value", ns::DATA_FORMS).append(value.clone()).build());
            }
            builder = builder.append(field_builder.build());
        }
        builder.build()
    }

    /// The `FORM_TYPE` hidden field value, if present.
    pub fn form_type(&self) -> Option<&str> {
        self.value("FORM_TYPE")
    }

    /// Find a field by variable name.
    pub fn field(&self, var: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// First value of the named field.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.field(var).and_then(Field::value)
    }

    /// All values of the named field.
    pub fn values(&self, var: &str) -> &[String] {
        self.field(var).map(|f| f.values.as_slice()).unwrap_or(&[])
    }

    /// Boolean value of the named field (`1`/`true` or `0`/`false`).
    ///
    /// Unknown spellings answer `None` so callers can keep the previous
    /// setting instead of guessing.
    pub fn bool_value(&self, var: &str) -> Option<bool> {
        match self.value(var)? {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    /// Append a field with a single value.
    pub fn with_field(mut self, var: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(Field::new(var, value));
        self
    }

    /// Append a hidden `FORM_TYPE` field.
    pub fn with_form_type(mut self, form_type: &str) -> Self {
        self.fields.push(Field {
            var: "FORM_TYPE".to_string(),
            field_type: Some("hidden".to_string()),
            values: vec![form_type.to_string()],
        });
        self
    }

    /// Append a field with multiple values.
    pub fn with_values(mut self, var: impl Into<String>, values: Vec<String>) -> Self {
        self.fields.push(Field {
            var: var.into(),
            field_type: None,
            values,
        });
        self
    }
}

/// Extract the configuration form carried by a `<configure/>` element.
///
/// Owners may either submit a full data form or use the short form: an
/// `access` attribute naming the access model plus optional `group`
/// children naming allowed roster groups. The short form is expanded
/// into an equivalent submitted data form so downstream code handles a
/// single representation. Answers `None` when neither was sent.
pub fn sent_configuration_form(configure: &Element) -> Option<DataForm> {
    let mut form = DataForm::find_in(configure);

    if let Some(access_model) = configure.attr("access") {
        let mut completed = form.take().unwrap_or_else(|| {
            DataForm::new(FormKind::Submit).with_form_type(FORM_TYPE_NODE_CONFIG)
        });
        if completed.field("pubsub#access_model").is_none() {
            completed = completed.with_field("pubsub#access_model", access_model);
        } else {
            debug!(
                access = %access_model,
                "access model sent both in data form and as attribute"
            );
        }
        let groups: Vec<String> = configure
            .children()
            .filter(|c| c.name() == "group")
            .map(|g| g.text().trim().to_string())
            .collect();
        if !groups.is_empty() {
            completed = completed.with_values("pubsub#roster_groups_allowed", groups);
        }
        form = Some(completed);
    }

    form
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Element {
        xml.parse().expect("valid XML")
    }

    #[test]
    fn test_form_round_trip() {
        let form = DataForm::new(FormKind::Submit)
            .with_form_type(FORM_TYPE_NODE_CONFIG)
            .with_field("pubsub#access_model", "open")
            .with_values(
                "pubsub#roster_groups_allowed",
                vec!["friends".to_string(), "family".to_string()],
            );

        let elem = form.to_element();
        let parsed = DataForm::from_element(&elem).expect("should parse");

        assert_eq!(parsed.form_type(), Some(FORM_TYPE_NODE_CONFIG));
        assert_eq!(parsed.value("pubsub#access_model"), Some("open"));
        assert_eq!(parsed.values("pubsub#roster_groups_allowed").len(), 2);
    }

    #[test]
    fn test_bool_value_spellings() {
        let form = DataForm::new(FormKind::Submit)
            .with_field("a", "1")
            .with_field("b", "false")
            .with_field("c", "maybe");

        assert_eq!(form.bool_value("a"), Some(true));
        assert_eq!(form.bool_value("b"), Some(false));
        assert_eq!(form.bool_value("c"), None);
        assert_eq!(form.bool_value("missing"), None);
    }

    #[test]
    fn test_non_form_element_rejected() {
        let elem = parse("<query xmlns='jabber:iq:roster'/>");
        assert!(DataForm::from_element(&elem).is_none());
    }

    #[test]
    fn test_short_form_expansion() {
        let configure = parse(
            "<configure xmlns='http://jabber.org/protocol/pubsub' access='roster'>\
                <group>friends</group>\
                <group>family</group>\
            </configure>",
        );

        let form = sent_configuration_form(&configure).expect("expanded form");
        assert_eq!(form.form_type(), Some(FORM_TYPE_NODE_CONFIG));
        assert_eq!(form.value("pubsub#access_model"), Some("roster"));
        assert_eq!(
            form.values("pubsub#roster_groups_allowed"),
            &["friends".to_string(), "family".to_string()]
        );
    }

    #[test]
    fn test_short_form_does_not_override_submitted_model() {
        let configure = parse(
            "<configure xmlns='http://jabber.org/protocol/pubsub' access='open'>\
                <x xmlns='jabber:x:data' type='submit'>\
                    <field var='pubsub#access_model'><value>whitelist</value></field>\
                </x>\
            </configure>",
        );

        let form = sent_configuration_form(&configure).expect("form");
        assert_eq!(form.value("pubsub#access_model"), Some("whitelist"));
    }

    #[test]
    fn test_no_form_and_no_access_attribute() {
        let configure = parse("<configure xmlns='http://jabber.org/protocol/pubsub'/>");
        assert!(sent_configuration_form(&configure).is_none());
    }
}
