//! Engine: the job submitter, continuation handler, completion check and
//! dead-letter inspector, composed over the activity store, the channels and
//! the external collaborators.

pub mod completion;
pub mod handler;
pub mod inspector;
pub mod notify;
pub mod status;
pub mod submitter;

pub use completion::{CompletionOutcome, CompletionTracker};
pub use handler::{BatchReport, ContinuationHandler, HandlerError, SkipReason, UnitOutcome};
pub use inspector::{DeadLetterInspector, InspectedFailure, InspectorError, UnitResolution};
pub use notify::{CompletionNotifier, JobNotification, NoopNotifier, RecordingNotifier};
pub use status::{JobStatusReport, UnitFailure, job_status};
pub use submitter::{CancelOutcome, JobSubmitter, SubmitError, SubmitOutcome};
