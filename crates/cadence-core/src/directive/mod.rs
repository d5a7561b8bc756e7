//! Directive model and the handler contract.
//!
//! A directive is a server-issued instruction routed by `(namespace, name)`
//! to exactly one [`DirectiveHandler`]. Payloads are opaque strings: this
//! crate never interprets them.

mod handler;
mod policy;
mod result;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use handler::DirectiveHandler;
pub use policy::{BlockingPolicy, CancelPolicy, Medium};
pub use result::{DirectiveInfo, DirectiveOutcome, DirectiveResult};

pub(crate) use result::ResultReporter;

/// Routing key of a directive or context provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceAndName {
    pub namespace: String,
    pub name: String,
}

impl NamespaceAndName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespaceAndName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Directive header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub namespace: String,
    pub name: String,
    pub message_id: String,
    pub dialog_request_id: String,
    /// Dialog request that triggered this one, for follow-up directives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_dialog_request_id: Option<String>,
}

impl Header {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        message_id: impl Into<String>,
        dialog_request_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            message_id: message_id.into(),
            dialog_request_id: dialog_request_id.into(),
            referrer_dialog_request_id: None,
        }
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer_dialog_request_id: impl Into<String>) -> Self {
        self.referrer_dialog_request_id = Some(referrer_dialog_request_id.into());
        self
    }
}

/// A server-issued directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub header: Header,
    /// Opaque payload, passed through untouched.
    pub payload: String,
}

impl Directive {
    pub fn new(header: Header, payload: impl Into<String>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.header.namespace
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    pub fn dialog_request_id(&self) -> &str {
        &self.header.dialog_request_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn namespace_and_name(&self) -> NamespaceAndName {
        NamespaceAndName::new(&self.header.namespace, &self.header.name)
    }
}
