use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::Span;

use super::{
    ContextRequestError, ContextRequester, ContextSetter, ContextStateProvider, ContextType,
    SetStateResult, StateRefreshPolicy,
};
use crate::directive::NamespaceAndName;
use crate::scheduler::{TaskScheduler, TimerHandle};
use crate::utils;

struct ProviderEntry {
    provider: Arc<dyn ContextStateProvider>,
    /// `None` until the provider reports for the first time.
    refresh_policy: Option<StateRefreshPolicy>,
    full: Option<String>,
    compact: Option<String>,
}

impl ProviderEntry {
    fn store(&mut self, value: String, refresh_policy: StateRefreshPolicy, context_type: ContextType) {
        self.refresh_policy = Some(refresh_policy);
        match context_type {
            ContextType::Full => self.full = Some(value),
            ContextType::Compact => self.compact = Some(value),
        }
    }

    fn is_cached_forever(&self) -> bool {
        self.refresh_policy == Some(StateRefreshPolicy::Never)
            && (self.full.is_some() || self.compact.is_some())
    }
}

struct PendingRequest {
    requester: Arc<dyn ContextRequester>,
    target: Option<NamespaceAndName>,
    awaiting: HashSet<NamespaceAndName>,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct State {
    providers: BTreeMap<NamespaceAndName, ProviderEntry>,
    pending: HashMap<u64, PendingRequest>,
    next_token: u64,
}

impl State {
    /// Build the snapshot for a request.
    fn assemble(&self, target: Option<&NamespaceAndName>) -> String {
        let mut root = Map::new();

        for (key, entry) in &self.providers {
            let Some(refresh_policy) = entry.refresh_policy else {
                continue;
            };
            let value = if target == Some(key) {
                entry.full.as_ref().or(entry.compact.as_ref())
            } else {
                entry.compact.as_ref().or(entry.full.as_ref())
            };

            let json = match value {
                Some(v) if !v.is_empty() => {
                    serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
                }
                _ if refresh_policy == StateRefreshPolicy::Sometimes => continue,
                _ => Value::Null,
            };

            // Providers sharing a namespace merge their objects.
            let unmerged = match (root.get_mut(&key.namespace), json) {
                (Some(Value::Object(existing)), Value::Object(more)) => {
                    existing.extend(more);
                    None
                }
                (_, json) => Some(json),
            };
            if let Some(json) = unmerged {
                root.insert(key.namespace.clone(), json);
            }
        }

        Value::Object(root).to_string()
    }
}

pub(super) struct Inner {
    state: Mutex<State>,
    scheduler: TaskScheduler,
    span: Span,
}

impl Inner {
    pub(super) fn set_state(
        &self,
        key: &NamespaceAndName,
        value: String,
        refresh_policy: StateRefreshPolicy,
        context_type: ContextType,
        token: Option<u64>,
    ) -> SetStateResult {
        let _guard = self.span.enter();

        let completed = {
            let mut state = utils::lock(&self.state);
            let state = &mut *state;

            let Some(entry) = state.providers.get_mut(key) else {
                tracing::debug!(provider = %key, "State from unregistered provider");
                return SetStateResult::StateProviderNotRegistered;
            };

            match token {
                None => {
                    entry.store(value, refresh_policy, context_type);
                    None
                }
                Some(token) => {
                    let Some(request) = state.pending.get_mut(&token) else {
                        tracing::debug!(provider = %key, token, "State for finished request");
                        return SetStateResult::StateTokenOutdated;
                    };
                    if !request.awaiting.remove(key) {
                        tracing::debug!(provider = %key, token, "Provider already answered");
                        return SetStateResult::StateTokenOutdated;
                    }
                    entry.store(value, refresh_policy, context_type);

                    if request.awaiting.is_empty() {
                        state.pending.remove(&token).map(|r| {
                            let context = state.assemble(r.target.as_ref());
                            (token, r, context)
                        })
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((token, request, context)) = completed {
            self.deliver(token, request, context);
        }
        SetStateResult::Success
    }

    fn deliver(&self, token: u64, request: PendingRequest, context: String) {
        tracing::debug!(token, bytes = context.len(), "Context assembled");
        let PendingRequest {
            requester, timer, ..
        } = request;
        drop(timer);
        self.scheduler
            .execute(move || requester.on_context_available(context));
    }

    fn on_timeout(&self, token: u64) {
        let _guard = self.span.enter();
        let Some(request) = utils::lock(&self.state).pending.remove(&token) else {
            return;
        };

        tracing::warn!(
            token,
            missing = ?request.awaiting,
            "Context request timed out"
        );
        let requester = request.requester;
        self.scheduler.execute(move || {
            requester.on_context_failure(ContextRequestError::StateProviderTimeout);
        });
    }
}

/// Fans a context request out to providers and the answers back in.
///
/// Several requests may be in flight at once; each has its own token, its own
/// set of providers still owed an answer and its own timeout.
pub struct ContextAggregator {
    inner: Arc<Inner>,
}

impl ContextAggregator {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self::with_span(scheduler, tracing::info_span!("context_aggregator"))
    }

    pub fn with_span(scheduler: TaskScheduler, span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                scheduler,
                span,
            }),
        }
    }

    /// Setter for unsolicited updates and for handing to providers.
    pub fn setter(&self) -> ContextSetter {
        ContextSetter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a provider. Returns `false` if its key is already taken.
    pub fn add_provider(&self, provider: Arc<dyn ContextStateProvider>) -> bool {
        let key = provider.namespace_and_name();
        let mut state = utils::lock(&self.inner.state);
        if state.providers.contains_key(&key) {
            return false;
        }
        tracing::debug!(parent: &self.inner.span, provider = %key, "Context provider registered");
        state.providers.insert(
            key,
            ProviderEntry {
                provider,
                refresh_policy: None,
                full: None,
                compact: None,
            },
        );
        true
    }

    /// Unregister a provider and its cached state.
    ///
    /// In-flight requests stop waiting for it and complete if it was the
    /// last one they were owed.
    pub fn remove_provider(&self, key: &NamespaceAndName) -> bool {
        let _guard = self.inner.span.enter();

        let completed: Vec<_> = {
            let mut state = utils::lock(&self.inner.state);
            if state.providers.remove(key).is_none() {
                return false;
            }

            let finished: Vec<u64> = state
                .pending
                .iter_mut()
                .filter_map(|(token, request)| {
                    (request.awaiting.remove(key) && request.awaiting.is_empty()).then_some(*token)
                })
                .collect();

            finished
                .into_iter()
                .filter_map(|token| {
                    let request = state.pending.remove(&token)?;
                    let context = state.assemble(request.target.as_ref());
                    Some((token, request, context))
                })
                .collect()
        };

        for (token, request, context) in completed {
            self.inner.deliver(token, request, context);
        }
        true
    }

    /// Report state directly, as a provider would through its setter.
    pub fn set_state(
        &self,
        key: &NamespaceAndName,
        state: impl Into<String>,
        refresh_policy: StateRefreshPolicy,
        context_type: ContextType,
        token: Option<u64>,
    ) -> SetStateResult {
        self.inner
            .set_state(key, state.into(), refresh_policy, context_type, token)
    }

    /// Request a snapshot and return the request token.
    ///
    /// Without `target` every provider is asked, except `Never` providers
    /// whose value is already cached. With `target` only that provider is
    /// asked and the rest contribute their cached values; an unregistered
    /// target contributes nothing. `requester` is called exactly once, on a
    /// scheduler thread, never on the caller's.
    pub fn get_context(
        &self,
        requester: Arc<dyn ContextRequester>,
        target: Option<&NamespaceAndName>,
        timeout: Duration,
    ) -> u64 {
        let _guard = self.inner.span.enter();

        let (token, asks) = {
            let mut state = utils::lock(&self.inner.state);
            let token = state.next_token;
            state.next_token += 1;

            let asks: Vec<(NamespaceAndName, Arc<dyn ContextStateProvider>)> = match target {
                None => state
                    .providers
                    .iter()
                    .filter(|(_, e)| !e.is_cached_forever())
                    .map(|(k, e)| (k.clone(), Arc::clone(&e.provider)))
                    .collect(),
                Some(target) => state
                    .providers
                    .get(target)
                    .map(|e| (target.clone(), Arc::clone(&e.provider)))
                    .into_iter()
                    .collect(),
            };

            let request = PendingRequest {
                requester,
                target: target.cloned(),
                awaiting: asks.iter().map(|(k, _)| k.clone()).collect(),
                timer: None,
            };

            if asks.is_empty() {
                let context = state.assemble(target);
                drop(state);
                self.inner.deliver(token, request, context);
                return token;
            }

            state.pending.insert(token, request);
            (token, asks)
        };

        tracing::debug!(token, providers = asks.len(), ?timeout, "Requesting context");

        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(token);
            }
        });
        if let Some(request) = utils::lock(&self.inner.state).pending.get_mut(&token) {
            request.timer = Some(timer);
        }

        let setter = self.setter();
        for (key, provider) in asks {
            provider.provide_state(&setter, &key, ContextType::Full, token);
        }
        token
    }

    /// Requests still waiting for providers.
    pub fn pending_requests(&self) -> usize {
        utils::lock(&self.inner.state).pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Available(Value),
        Failed(ContextRequestError),
    }

    struct ChannelRequester(UnboundedSender<Outcome>);

    impl ContextRequester for ChannelRequester {
        fn on_context_available(&self, context: String) {
            let _ = self.0.send(Outcome::Available(serde_json::from_str(&context).unwrap()));
        }

        fn on_context_failure(&self, error: ContextRequestError) {
            let _ = self.0.send(Outcome::Failed(error));
        }
    }

    fn requester() -> (Arc<dyn ContextRequester>, UnboundedReceiver<Outcome>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(ChannelRequester(tx)), rx)
    }

    /// Provider answering synchronously with a fixed value, or not at all.
    struct FixedProvider {
        key: NamespaceAndName,
        value: Option<String>,
        policy: StateRefreshPolicy,
        asked: AtomicUsize,
    }

    impl FixedProvider {
        fn new(ns: &str, value: Option<&str>, policy: StateRefreshPolicy) -> Arc<Self> {
            Arc::new(Self {
                key: NamespaceAndName::new(ns, "state"),
                value: value.map(str::to_string),
                policy,
                asked: AtomicUsize::new(0),
            })
        }
    }

    impl ContextStateProvider for FixedProvider {
        fn namespace_and_name(&self) -> NamespaceAndName {
            self.key.clone()
        }

        fn provide_state(
            &self,
            setter: &ContextSetter,
            key: &NamespaceAndName,
            context_type: ContextType,
            token: u64,
        ) {
            self.asked.fetch_add(1, Ordering::SeqCst);
            if let Some(value) = &self.value {
                let result = setter.set_state(key, value.clone(), self.policy, context_type, Some(token));
                assert_eq!(result, SetStateResult::Success);
            }
        }
    }

    async fn next(rx: &mut UnboundedReceiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("requester should be called")
            .expect("sender alive")
    }

    fn aggregator() -> ContextAggregator {
        ContextAggregator::new(TaskScheduler::current().unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn assembles_all_providers_by_namespace() {
        let aggregator = aggregator();
        aggregator.add_provider(FixedProvider::new("TTS", Some(r#"{"state":"IDLE"}"#), StateRefreshPolicy::Always));
        aggregator.add_provider(FixedProvider::new("Device", Some("living-room"), StateRefreshPolicy::Always));
        let (requester, mut rx) = requester();

        aggregator.get_context(requester, None, Duration::from_secs(1));

        assert_eq!(
            next(&mut rx).await,
            Outcome::Available(serde_json::json!({
                "TTS": {"state": "IDLE"},
                "Device": "living-room",
            }))
        );
        assert_eq!(aggregator.pending_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_policy_is_served_from_cache() {
        let aggregator = aggregator();
        let provider = FixedProvider::new("System", Some(r#"{"v":1}"#), StateRefreshPolicy::Never);
        aggregator.add_provider(provider.clone());

        for _ in 0..2 {
            let (requester, mut rx) = requester();
            aggregator.get_context(requester, None, Duration::from_secs(1));
            assert_eq!(
                next(&mut rx).await,
                Outcome::Available(serde_json::json!({"System": {"v": 1}}))
            );
        }
        assert_eq!(provider.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_sometimes_state_is_omitted() {
        let aggregator = aggregator();
        aggregator.add_provider(FixedProvider::new("Alerts", Some(""), StateRefreshPolicy::Sometimes));
        aggregator.add_provider(FixedProvider::new("Display", Some(""), StateRefreshPolicy::Always));
        let (requester, mut rx) = requester();

        aggregator.get_context(requester, None, Duration::from_secs(1));

        assert_eq!(
            next(&mut rx).await,
            Outcome::Available(serde_json::json!({"Display": null}))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn target_request_asks_only_the_target() {
        let aggregator = aggregator();
        let tts = FixedProvider::new("TTS", Some(r#"{"full":true}"#), StateRefreshPolicy::Always);
        let display = FixedProvider::new("Display", None, StateRefreshPolicy::Always);
        aggregator.add_provider(tts.clone());
        aggregator.add_provider(display.clone());

        let display_key = display.namespace_and_name();
        aggregator.set_state(&display_key, r#"{"full":true}"#, StateRefreshPolicy::Always, ContextType::Full, None);
        aggregator.set_state(&display_key, r#"{"compact":true}"#, StateRefreshPolicy::Always, ContextType::Compact, None);

        let (requester, mut rx) = requester();
        aggregator.get_context(requester, Some(&tts.namespace_and_name()), Duration::from_secs(1));

        assert_eq!(
            next(&mut rx).await,
            Outcome::Available(serde_json::json!({
                "TTS": {"full": true},
                "Display": {"compact": true},
            }))
        );
        assert_eq!(display.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unregistered_target_is_tolerated() {
        let aggregator = aggregator();
        let (requester, mut rx) = requester();

        aggregator.get_context(requester, Some(&NamespaceAndName::new("Ghost", "state")), Duration::from_secs(1));

        assert_eq!(next(&mut rx).await, Outcome::Available(serde_json::json!({})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_fails_once_and_rejects_late_state() {
        let aggregator = aggregator();
        let silent = FixedProvider::new("Slow", None, StateRefreshPolicy::Always);
        aggregator.add_provider(silent.clone());
        let (requester, mut rx) = requester();

        let token = aggregator.get_context(requester, None, Duration::from_millis(30));

        assert_eq!(
            next(&mut rx).await,
            Outcome::Failed(ContextRequestError::StateProviderTimeout)
        );
        assert_eq!(
            aggregator.set_state(&silent.namespace_and_name(), "late", StateRefreshPolicy::Always, ContextType::Full, Some(token)),
            SetStateResult::StateTokenOutdated
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removing_last_awaited_provider_completes_request() {
        let aggregator = aggregator();
        let silent = FixedProvider::new("Slow", None, StateRefreshPolicy::Always);
        aggregator.add_provider(silent.clone());
        let (requester, mut rx) = requester();

        aggregator.get_context(requester, None, Duration::from_secs(5));
        assert!(aggregator.remove_provider(&silent.namespace_and_name()));

        assert_eq!(next(&mut rx).await, Outcome::Available(serde_json::json!({})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_provider_and_dropped_aggregator_are_reported() {
        let aggregator = aggregator();
        let setter = aggregator.setter();
        let key = NamespaceAndName::new("Ghost", "state");

        assert_eq!(
            setter.set_state(&key, "x", StateRefreshPolicy::Always, ContextType::Full, None),
            SetStateResult::StateProviderNotRegistered
        );
        assert!(aggregator.add_provider(FixedProvider::new("A", None, StateRefreshPolicy::Always)));
        assert!(!aggregator.add_provider(FixedProvider::new("A", None, StateRefreshPolicy::Always)));
        drop(aggregator);
        assert_eq!(
            setter.set_state(&key, "x", StateRefreshPolicy::Always, ContextType::Full, None),
            SetStateResult::StateProviderNotRegistered
        );
    }
}
