/*!
 * Termination Registry
 * Demultiplexes child terminations to per-process callbacks, one model per platform
 */

#[cfg(unix)]
mod chain;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use chain::PriorDisposition;

use crate::types::{ChildHandle, NotifyError, NotifyResult, TermCallback, WatchToken};
use log::info;
use parking_lot::Mutex;
use tokio::runtime::Handle;

#[cfg(unix)]
use std::sync::Arc;

#[cfg(unix)]
struct Active {
    registry: Arc<unix::SigchldRegistry>,
}

#[cfg(windows)]
struct Active {
    event_loop: Handle,
}

/// Process-wide owner of child-termination notification
///
/// Explicitly constructed rather than an ambient global: the embedding
/// application (or a test) creates one monitor, injects the event loop it
/// should deliver on, and threads the monitor through its process-creation
/// flow. Activation is idempotent; the first call does the one-time
/// prior-handler capture and signal subscription, later calls are no-ops.
pub struct ChildMonitor {
    active: Mutex<Option<Active>>,
}

impl ChildMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// Guarantee the registry exists and is subscribed on the given loop
    ///
    /// Signal-model: captures the previous SIGCHLD disposition, then
    /// subscribes to SIGCHLD delivery, in that order, so the snapshot never
    /// captures our own subscription. Handle-model: merely records the
    /// event loop for later watches, since the waitable object only exists
    /// once a child has been created.
    pub fn ensure_active(&self, event_loop: &Handle) -> NotifyResult<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            let prior = PriorDisposition::capture();
            let registry = Arc::new(unix::SigchldRegistry::new(prior));

            // signal() both installs the driver's SIGCHLD handler and hands
            // back the stream; it needs the runtime's reactor in scope.
            let _guard = event_loop.enter();
            let stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child())
                .map_err(|e| NotifyError::SubscribeFailed(e.to_string()))?;
            event_loop.spawn(unix::run(Arc::clone(&registry), stream));

            info!("Child termination registry active (prior: {:?})", prior);
            *active = Some(Active { registry });
        }

        #[cfg(windows)]
        {
            info!("Child termination registry active (handle model)");
            *active = Some(Active {
                event_loop: event_loop.clone(),
            });
        }

        Ok(())
    }

    /// Associate a termination callback with a successfully created child
    ///
    /// Never blocks. Returns a cancellation token; cancelling it prevents
    /// the callback from firing but does not un-reap the child.
    pub fn register(&self, child: &ChildHandle, callback: TermCallback) -> NotifyResult<WatchToken> {
        let active = self.active.lock();
        let active = active.as_ref().ok_or(NotifyError::NotActive)?;

        #[cfg(unix)]
        {
            Ok(active.registry.register(child.pid(), callback))
        }

        #[cfg(windows)]
        {
            windows::watch(&active.event_loop, child, callback)
        }
    }

    /// Number of registered children still awaiting termination
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let active = self.active.lock();
        match active.as_ref() {
            #[cfg(unix)]
            Some(active) => active.registry.pending_count(),
            #[cfg(windows)]
            Some(_) => 0,
            None => 0,
        }
    }

    /// Whether ensure_active has completed at least once
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}

impl Default for ChildMonitor {
    fn default() -> Self {
        Self::new()
    }
}
