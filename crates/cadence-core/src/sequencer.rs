//! Directive sequencer: routes directives to handlers under blocking policies.
//!
//! # Lifecycle of one directive
//!
//! 1. Arrives in a group via [`DirectiveSequencer::on_directives`] and is
//!    tracked (queued) if a handler claims its `(namespace, name)`.
//! 2. `pre_handle_directive` runs at once, blocking or not.
//! 3. `handle_directive` runs when no earlier tracked directive, of any
//!    dialog turn, holds a medium it is blocked by.
//! 4. The handler reports through its [`DirectiveResult`]; the entry is
//!    dropped, the cancel policy is applied and waiting directives are
//!    re-evaluated.
//!
//! # Locking
//!
//! One mutex guards the handler table and the tracked directives. Handler
//! calls and observer notifications happen after it is released, so handlers
//! may report results synchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use tracing::Span;

use crate::directive::{
    BlockingPolicy, CancelPolicy, Directive, DirectiveHandler, DirectiveInfo, DirectiveOutcome,
    DirectiveResult, NamespaceAndName, ResultReporter,
};
use crate::error::DirectiveError;
use crate::observer::{ObserverRegistry, same_instance};
use crate::utils;

/// Something observable happened to a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveEvent {
    /// Tracked and handed to `pre_handle_directive`.
    Requested(Arc<Directive>),
    Completed(Arc<Directive>),
    Canceled(Arc<Directive>),
    Failed {
        directive: Arc<Directive>,
        description: String,
    },
    /// No handler is registered for the directive.
    Skipped(Arc<Directive>),
}

impl DirectiveEvent {
    pub fn directive(&self) -> &Directive {
        match self {
            Self::Requested(d) | Self::Completed(d) | Self::Canceled(d) | Self::Skipped(d) => d,
            Self::Failed { directive, .. } => directive,
        }
    }
}

/// Observer of directive lifecycle events.
pub trait DirectiveSequencerListener: Send + Sync {
    fn on_directive_event(&self, event: &DirectiveEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Handling,
}

struct Entry {
    info: DirectiveInfo,
    handler: Arc<dyn DirectiveHandler>,
    policy: BlockingPolicy,
    phase: Phase,
    pre_handled: bool,
}

impl Entry {
    fn dialog_request_id(&self) -> &str {
        self.info.directive.dialog_request_id()
    }
}

#[derive(Default)]
struct State {
    handlers: HashMap<NamespaceAndName, (Arc<dyn DirectiveHandler>, BlockingPolicy)>,
    /// Tracked directives by message id, in arrival order.
    entries: IndexMap<String, Entry>,
}

impl State {
    /// Mark every runnable directive as handling and return them.
    fn take_ready(&mut self) -> Vec<(DirectiveInfo, Arc<dyn DirectiveHandler>)> {
        let mut ready = Vec::new();
        for index in 0..self.entries.len() {
            let Some((_, entry)) = self.entries.get_index(index) else {
                continue;
            };
            if entry.phase != Phase::Queued || !entry.pre_handled {
                continue;
            }
            let blocked = self
                .entries
                .values()
                .take(index)
                .any(|earlier| entry.policy.is_blocked_by(&earlier.policy));
            if !blocked {
                ready.push(index);
            }
        }

        ready
            .into_iter()
            .filter_map(|index| {
                let (_, entry) = self.entries.get_index_mut(index)?;
                entry.phase = Phase::Handling;
                Some((entry.info.clone(), Arc::clone(&entry.handler)))
            })
            .collect()
    }

    /// Untrack the siblings of `dialog_request_id` selected by `policy`.
    fn take_cancelled(&mut self, dialog_request_id: &str, policy: &CancelPolicy) -> Vec<Entry> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.dialog_request_id() == dialog_request_id
                    && policy.covers(&e.info.directive.namespace_and_name())
            })
            .map(|(id, _)| id.clone())
            .collect();

        doomed
            .iter()
            .filter_map(|id| self.entries.shift_remove(id))
            .inspect(|e| e.info.result.mark_cancelled())
            .collect()
    }
}

struct Inner {
    state: Mutex<State>,
    listeners: ObserverRegistry<dyn DirectiveSequencerListener>,
    span: Span,
}

impl Inner {
    fn emit(&self, event: &DirectiveEvent) {
        self.listeners.notify(|l| l.on_directive_event(event));
    }

    fn cancel_entries(&self, cancelled: Vec<Entry>) {
        for entry in cancelled {
            tracing::debug!(message_id = %entry.info.directive.message_id(), "Cancelling directive");
            entry.handler.cancel_directive(entry.info.directive.message_id());
            self.emit(&DirectiveEvent::Canceled(entry.info.directive));
        }
    }

    fn dispatch_ready(&self) {
        let ready = utils::lock(&self.state).take_ready();

        for (info, handler) in ready {
            if info.result.is_cancelled() {
                continue;
            }
            let message_id = info.directive.message_id();
            tracing::debug!(%message_id, directive = %info.directive.namespace_and_name(), "Handling directive");

            if !handler.handle_directive(message_id) {
                tracing::warn!(%message_id, "Handler does not know the directive");
                if let Err(e) = info
                    .result
                    .set_failed("Handler rejected the directive", CancelPolicy::default())
                {
                    tracing::debug!(error = %e, "Rejected directive already finished");
                }
            }
        }
    }
}

impl ResultReporter for Inner {
    fn report(&self, message_id: &str, outcome: DirectiveOutcome) -> Result<(), DirectiveError> {
        let _guard = self.span.enter();

        let (entry, cancelled) = {
            let mut state = utils::lock(&self.state);
            let Some(entry) = state.entries.shift_remove(message_id) else {
                drop(state);
                tracing::error!(%message_id, "Result reported for an untracked directive");
                return Err(DirectiveError::NotTracked(message_id.to_string()));
            };
            let cancelled = match &outcome {
                DirectiveOutcome::Completed => Vec::new(),
                DirectiveOutcome::Failed { cancel_policy, .. } => {
                    state.take_cancelled(entry.dialog_request_id(), cancel_policy)
                }
            };
            (entry, cancelled)
        };

        let directive = entry.info.directive;
        match outcome {
            DirectiveOutcome::Completed => {
                tracing::debug!(%message_id, "Directive completed");
                self.emit(&DirectiveEvent::Completed(directive));
            }
            DirectiveOutcome::Failed { description, .. } => {
                tracing::warn!(%message_id, %description, cancelled = cancelled.len(), "Directive failed");
                self.emit(&DirectiveEvent::Failed {
                    directive,
                    description,
                });
            }
        }

        self.cancel_entries(cancelled);
        self.dispatch_ready();
        Ok(())
    }
}

/// Routes directives to registered handlers and serializes conflicting ones.
pub struct DirectiveSequencer {
    inner: Arc<Inner>,
}

impl DirectiveSequencer {
    /// Create a sequencer logging under a `directive_sequencer` span.
    pub fn new() -> Self {
        Self::with_span(tracing::info_span!("directive_sequencer"))
    }

    /// Create a sequencer logging under `span`.
    pub fn with_span(span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                listeners: ObserverRegistry::new(),
                span,
            }),
        }
    }

    /// Register `handler` for every key in its configuration.
    ///
    /// Fails without registering anything if any key is already claimed.
    pub fn add_handler(&self, handler: Arc<dyn DirectiveHandler>) -> Result<(), DirectiveError> {
        let _guard = self.inner.span.enter();
        let configurations = handler.configurations();

        let mut state = utils::lock(&self.inner.state);
        if let Some(taken) = configurations
            .keys()
            .find(|key| state.handlers.contains_key(*key))
        {
            return Err(DirectiveError::DuplicateHandler(taken.clone()));
        }
        for (key, policy) in configurations {
            tracing::debug!(directive = %key, ?policy, "Handler registered");
            state.handlers.insert(key, (Arc::clone(&handler), policy));
        }
        Ok(())
    }

    /// Unregister every key owned by `handler`. Returns whether any was.
    ///
    /// Directives already tracked for it keep running to completion.
    pub fn remove_handler(&self, handler: &Arc<dyn DirectiveHandler>) -> bool {
        let mut state = utils::lock(&self.inner.state);
        let before = state.handlers.len();
        state.handlers.retain(|_, (h, _)| !same_instance(h, handler));
        state.handlers.len() != before
    }

    pub fn add_listener(&self, listener: Arc<dyn DirectiveSequencerListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DirectiveSequencerListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Accept one directive group.
    pub fn on_directives(&self, directives: Vec<Directive>) {
        let _guard = self.inner.span.enter();
        let reporter: Weak<dyn ResultReporter> = Arc::downgrade(&self.inner) as Weak<dyn ResultReporter>;

        for directive in directives {
            let directive = Arc::new(directive);
            let key = directive.namespace_and_name();
            let message_id = directive.message_id().to_string();

            let tracked = {
                let mut state = utils::lock(&self.inner.state);
                if state.entries.contains_key(&message_id) {
                    drop(state);
                    tracing::warn!(%message_id, "Duplicate directive ignored");
                    continue;
                }
                state.handlers.get(&key).cloned().map(|(handler, policy)| {
                    let info = DirectiveInfo {
                        directive: Arc::clone(&directive),
                        result: DirectiveResult::new(&message_id, Weak::clone(&reporter)),
                    };
                    state.entries.insert(
                        message_id.clone(),
                        Entry {
                            info: info.clone(),
                            handler: Arc::clone(&handler),
                            policy,
                            phase: Phase::Queued,
                            pre_handled: false,
                        },
                    );
                    (info, handler)
                })
            };

            let Some((info, handler)) = tracked else {
                tracing::warn!(%message_id, directive = %key, "No handler registered, skipping");
                self.inner.emit(&DirectiveEvent::Skipped(directive));
                continue;
            };

            self.inner.emit(&DirectiveEvent::Requested(directive));
            handler.pre_handle_directive(info);

            if let Some(entry) = utils::lock(&self.inner.state).entries.get_mut(&message_id) {
                entry.pre_handled = true;
            }
        }

        self.inner.dispatch_ready();
    }

    /// Cancel every tracked directive of one dialog turn.
    pub fn cancel_dialog_request_id(&self, dialog_request_id: &str) {
        let _guard = self.inner.span.enter();
        let cancelled = utils::lock(&self.inner.state)
            .take_cancelled(dialog_request_id, &CancelPolicy::all());
        tracing::debug!(%dialog_request_id, count = cancelled.len(), "Cancelling dialog request");
        self.inner.cancel_entries(cancelled);
        self.inner.dispatch_ready();
    }

    /// Number of tracked directives, queued or handling.
    pub fn pending_count(&self) -> usize {
        utils::lock(&self.inner.state).entries.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }
}

impl Default for DirectiveSequencer {
    fn default() -> Self {
        Self::new()
    }
}
