//! Error types for the coordination runtime.
//!
//! Only programmer errors and environment failures live here. Flow-control
//! outcomes (token outdated, sync denied, provider timeout) are plain enums
//! or callbacks next to the component that produces them.

use crate::directive::NamespaceAndName;

/// Errors raised by directive dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    /// Another handler already claims this namespace/name.
    #[error("A handler is already registered for {0}")]
    DuplicateHandler(NamespaceAndName),

    /// The handler reported a terminal result twice for the same directive.
    #[error("Result for directive {0} was already reported")]
    AlreadyReported(String),

    /// The directive is no longer tracked (cancelled, or already finished).
    #[error("Directive {0} is not tracked by the sequencer")]
    NotTracked(String),

    /// The sequencer that issued the result sink has been dropped.
    #[error("Directive sequencer for {0} no longer exists")]
    SequencerGone(String),
}

/// Errors raised while building a [`TaskScheduler`](crate::scheduler::TaskScheduler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No tokio runtime is running on the calling thread.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
