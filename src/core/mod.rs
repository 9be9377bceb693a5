pub mod errors;
pub mod events;
pub mod models;
pub mod reconciler;
pub mod state;

pub use errors::{ActionError, RecordError, SourceError};
pub use events::{ChangeKind, Delivery, Diagnostic, EntityKind, Notification, Origin, Snapshot};
pub use reconciler::{ApplyOutcome, Phase, Reconciler};
pub use state::{ViewModel, DEFAULT_EVENT_LIMIT};
