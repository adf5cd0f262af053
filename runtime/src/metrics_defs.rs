//! Metric names emitted by the runtime. Exporter installation is the
//! host's concern.

pub const MESSAGES_PROCESSED: &str = "runtime.server.messages_processed";
pub const RECEIVER_FAILURES: &str = "runtime.server.receiver_failures";
pub const MAILBOX_BACKPRESSURE: &str = "runtime.server.mailbox_backpressure";
pub const ROUTED_LOCAL: &str = "runtime.router.local_calls";
pub const ROUTED_REMOTE: &str = "runtime.router.remote_calls";
