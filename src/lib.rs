//! `attendance-scanner` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The core “business logic” lives in [`crate::app`] where it
//! can be tested deterministically with an injected advertisement source and an
//! injected HTTP transport.

pub mod app;
pub mod beacon;
pub mod diagnostics;
pub mod event_log;
pub mod mac_address;
pub mod pipeline;
pub mod queue;
pub mod scanner;
pub mod throttle;
pub mod verify;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{Options, RunError, run, run_with};
pub use beacon::{BeaconFrame, decode_ibeacon};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use event_log::{EventLog, EventLogConfig, LogRecord};
pub use mac_address::MacAddress;
pub use pipeline::{Disposition, Origin, Pipeline, PipelineConfig};
pub use queue::{EnqueueError, QueueConsumer, QueueProducer, handoff_queue};
pub use scanner::{Advertisement, AdvertisementSource, ScanError};
pub use throttle::{ThrottleStore, parse_duration};
pub use verify::{CredentialError, Transport, VerificationClient, VerificationOutcome};
