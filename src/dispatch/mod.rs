//! Backend dispatch: transport seam, retry policy, failure tracking, recovery.

mod engine;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use engine::{DispatchEngine, DispatchError, NormalizedResult};
pub use recovery::{ProbeOutcome, RecoveryProbe, RecoverySettings};
pub use retry::{format_retries_header, AttemptRecord, FailureClass, RetryPolicy};
pub use state::{FailureSnapshot, FailureTracker};
pub use transport::{BackendError, BackendRequest, HttpTransport, Transport};
