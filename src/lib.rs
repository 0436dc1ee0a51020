/*!
 * Child Termination Notification
 * Reports child-process exits to caller-supplied callbacks through a tokio event loop
 */

pub mod hooks;
pub mod registry;
pub mod types;

// Re-export public API
pub use hooks::{on_create_success, on_precreate};
pub use registry::ChildMonitor;
#[cfg(unix)]
pub use registry::PriorDisposition;
pub use types::{
    ChildHandle, NotifyError, NotifyResult, Pid, TermCallback, Termination, TerminationCause,
    WatchToken,
};
