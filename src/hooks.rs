/*!
 * Registration Hooks
 * Extension points wired into the process-creation flow
 */

use crate::registry::ChildMonitor;
use crate::types::{ChildHandle, NotifyResult, TermCallback, WatchToken};
use log::debug;
use tokio::runtime::Handle;

/// Pre-creation hook: run before the OS-level spawn call
///
/// Under the signal model the registry must be subscribed before the child
/// can possibly exit; a child that dies before subscription would be
/// unreapable as ours. Under the handle model there is nothing to intercept
/// yet, so this only records the event loop.
pub fn on_precreate(monitor: &ChildMonitor, event_loop: &Handle) -> NotifyResult<()> {
    monitor.ensure_active(event_loop)
}

/// Post-creation hook: run only if the spawn succeeded
///
/// Associates the new child's identity (or native handle) with its
/// termination callback. Must not run on spawn failure; there is no
/// process to terminate.
pub fn on_create_success(
    monitor: &ChildMonitor,
    child: &ChildHandle,
    callback: TermCallback,
) -> NotifyResult<WatchToken> {
    debug!("Child created, registering termination watch for pid {}", child.pid());
    monitor.register(child, callback)
}
