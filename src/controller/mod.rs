pub mod context;
pub mod diff;
pub mod error;
pub mod ownership;
pub mod queue;
pub mod reconciler;
pub mod remediation;
pub mod status;
pub mod validation;
pub mod watch;

pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorKind, Result};
pub use ownership::Ownership;
pub use queue::{ObjectKey, QueueError, Requeue, WorkQueue};
pub use reconciler::{FINALIZER, handle_error, process, reconcile, run_worker};
pub use remediation::{RemediationConfig, Remediator};
pub use status::{ConditionBuilder, compute_status, write_status};
pub use validation::{MIN_REPLICAS, validate_spec};
pub use watch::Watchers;
