#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unused_crate_dependencies)]

pub mod context;
pub mod dialog_ux;
pub mod directive;
pub mod error;
pub mod observer;
pub mod play_sync;
pub mod scheduler;
pub mod sequencer;
pub mod session;
pub mod settings;

pub mod utils;

// Re-export commonly used types for convenience
pub use context::{
    ContextAggregator, ContextRequestError, ContextRequester, ContextSetter, ContextStateProvider,
    ContextType, SetStateResult, StateRefreshPolicy,
};
pub use dialog_ux::{
    AsrState, ConnectionStatus, DialogUxSnapshot, DialogUxState, DialogUxStateAggregator,
    DialogUxStateListener, TtsState,
};
pub use directive::{
    BlockingPolicy, CancelPolicy, Directive, DirectiveHandler, DirectiveInfo, DirectiveResult,
    Header, Medium, NamespaceAndName,
};
pub use error::{DirectiveError, SchedulerError};
pub use observer::ObserverRegistry;
pub use play_sync::{OnRequestSyncListener, PlaySynchronizer, SynchronizeObject};
pub use scheduler::{TaskScheduler, TimerHandle};
pub use sequencer::{DirectiveEvent, DirectiveSequencer, DirectiveSequencerListener};
pub use session::{Requester, Session, SessionListener, SessionManager};
pub use settings::{Settings, SettingsError, SettingsUpdate, validate_settings};
