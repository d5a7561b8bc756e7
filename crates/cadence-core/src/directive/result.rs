//! One-shot result sink bound to a tracked directive.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::{CancelPolicy, Directive};
use crate::error::DirectiveError;

/// Terminal outcome of a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveOutcome {
    Completed,
    Failed {
        description: String,
        cancel_policy: CancelPolicy,
    },
}

/// Receiver of results (the sequencer).
pub(crate) trait ResultReporter: Send + Sync {
    fn report(&self, message_id: &str, outcome: DirectiveOutcome) -> Result<(), DirectiveError>;
}

#[derive(Debug, Default)]
struct ResultState {
    reported: AtomicBool,
    cancelled: AtomicBool,
}

/// One-shot sink a handler uses to report the terminal outcome of a directive.
///
/// Clones share state: whichever clone reports first wins, every later report
/// is an error.
#[derive(Clone)]
pub struct DirectiveResult {
    message_id: String,
    state: Arc<ResultState>,
    reporter: Weak<dyn ResultReporter>,
}

impl DirectiveResult {
    pub(crate) fn new(message_id: impl Into<String>, reporter: Weak<dyn ResultReporter>) -> Self {
        Self {
            message_id: message_id.into(),
            state: Arc::default(),
            reporter,
        }
    }

    /// Report successful completion.
    pub fn set_completed(&self) -> Result<(), DirectiveError> {
        self.report(DirectiveOutcome::Completed)
    }

    /// Report failure; `cancel_policy` decides which siblings are cancelled.
    pub fn set_failed(
        &self,
        description: impl Into<String>,
        cancel_policy: CancelPolicy,
    ) -> Result<(), DirectiveError> {
        self.report(DirectiveOutcome::Failed {
            description: description.into(),
            cancel_policy,
        })
    }

    /// Whether the sequencer cancelled this directive.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub(crate) fn mark_cancelled(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    fn report(&self, outcome: DirectiveOutcome) -> Result<(), DirectiveError> {
        if self.state.reported.swap(true, Ordering::SeqCst) {
            tracing::error!(message_id = %self.message_id, "Directive result reported twice");
            return Err(DirectiveError::AlreadyReported(self.message_id.clone()));
        }

        let Some(reporter) = self.reporter.upgrade() else {
            tracing::error!(message_id = %self.message_id, "Directive result reported after sequencer shutdown");
            return Err(DirectiveError::SequencerGone(self.message_id.clone()));
        };

        reporter.report(&self.message_id, outcome)
    }
}

impl fmt::Debug for DirectiveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveResult")
            .field("message_id", &self.message_id)
            .field("reported", &self.state.reported.load(Ordering::SeqCst))
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A directive bound to its result sink, handed to `pre_handle_directive`.
#[derive(Debug, Clone)]
pub struct DirectiveInfo {
    pub directive: Arc<Directive>,
    pub result: DirectiveResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, DirectiveOutcome)>>);

    impl ResultReporter for Recorder {
        fn report(&self, message_id: &str, outcome: DirectiveOutcome) -> Result<(), DirectiveError> {
            self.0.lock().unwrap().push((message_id.to_string(), outcome));
            Ok(())
        }
    }

    #[test]
    fn second_report_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ResultReporter> = Arc::downgrade(&recorder) as Weak<dyn ResultReporter>;
        let result = DirectiveResult::new("m-1", weak);
        let clone = result.clone();

        assert!(result.set_completed().is_ok());
        assert_eq!(
            clone.set_failed("late", CancelPolicy::none()),
            Err(DirectiveError::AlreadyReported("m-1".into()))
        );
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn report_after_reporter_dropped_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ResultReporter> = Arc::downgrade(&recorder) as Weak<dyn ResultReporter>;
        let result = DirectiveResult::new("m-2", weak);
        drop(recorder);

        assert_eq!(
            result.set_completed(),
            Err(DirectiveError::SequencerGone("m-2".into()))
        );
    }
}
