//! Context aggregation: many independent state providers, one snapshot.
//!
//! Providers are asked for their state with a request token and answer, on
//! any thread, through a [`ContextSetter`]. The [`ContextAggregator`] fans the
//! answers back in and hands the requester one JSON document keyed by
//! provider namespace.

mod aggregator;

use std::sync::Weak;

use serde::{Deserialize, Serialize};

pub use aggregator::ContextAggregator;

use crate::directive::NamespaceAndName;

/// How a provider's last value may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateRefreshPolicy {
    /// The cached value is reused; the provider is not asked again.
    Never,
    /// The provider is asked on every full request.
    Always,
    /// Like `Always`, but an empty value is left out of the snapshot.
    Sometimes,
}

/// Shape of the state a provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
    Full,
    /// Cheaper shape used when the provider is not the request target.
    Compact,
}

/// Outcome of [`ContextSetter::set_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStateResult {
    Success,
    StateProviderNotRegistered,
    /// The token does not belong to an in-flight request awaiting this
    /// provider. The value was discarded.
    StateTokenOutdated,
}

/// Terminal failure of a context request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextRequestError {
    #[error("State provider did not respond before the request timed out")]
    StateProviderTimeout,
}

/// A component contributing a piece of context.
pub trait ContextStateProvider: Send + Sync {
    /// Key under which this provider is registered.
    fn namespace_and_name(&self) -> NamespaceAndName;

    /// Report state for `token` through `setter`, now or later, from any
    /// thread. Never called with an aggregator lock held.
    fn provide_state(
        &self,
        setter: &ContextSetter,
        namespace_and_name: &NamespaceAndName,
        context_type: ContextType,
        token: u64,
    );
}

/// Receiver of one context request's terminal callback.
///
/// Exactly one of the two methods is called per request, on a scheduler
/// thread.
pub trait ContextRequester: Send + Sync {
    fn on_context_available(&self, context: String);
    fn on_context_failure(&self, error: ContextRequestError);
}

/// Cloneable handle through which providers report state.
///
/// Holds the aggregator weakly; once it is dropped every report answers
/// [`SetStateResult::StateProviderNotRegistered`].
#[derive(Clone)]
pub struct ContextSetter {
    inner: Weak<aggregator::Inner>,
}

impl ContextSetter {
    /// Report state. `token = None` is an unsolicited cache update.
    pub fn set_state(
        &self,
        namespace_and_name: &NamespaceAndName,
        state: impl Into<String>,
        refresh_policy: StateRefreshPolicy,
        context_type: ContextType,
        token: Option<u64>,
    ) -> SetStateResult {
        match self.inner.upgrade() {
            Some(inner) => inner.set_state(
                namespace_and_name,
                state.into(),
                refresh_policy,
                context_type,
                token,
            ),
            None => SetStateResult::StateProviderNotRegistered,
        }
    }
}

impl std::fmt::Debug for ContextSetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSetter")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}
