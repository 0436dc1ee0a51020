/*!
 * Signal-Model Termination Registry
 * Reaps exited children on SIGCHLD and demultiplexes callbacks by pid
 */

use super::chain::PriorDisposition;
use crate::types::{Pid, TermCallback, Termination, TerminationCause, WatchToken};
use ahash::RandomState;
use log::{debug, trace, warn};
use nix::sys::wait::WaitStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal::unix::Signal;

/// Pending-callback entry, removed exactly once when its child terminates
struct PendingEntry {
    callback: TermCallback,
    token: WatchToken,
}

/// Outcome of one non-blocking reap attempt
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReapOutcome {
    /// A child state change was consumed and routed
    Dispatched,
    /// Nothing reapable; the wakeup was spurious for this subsystem
    Spurious,
}

/// Process-wide owner of the SIGCHLD interception
///
/// There is exactly one OS slot for "who handles SIGCHLD", so a single
/// registry instance coordinates it: reaping, callback demultiplexing, and
/// forwarding of events that belong to the previous handler. All table
/// access happens on event-loop tasks or registration callers, never in
/// signal-handler context; the table is mutex-guarded for that reason.
pub struct SigchldRegistry {
    prior: PriorDisposition,
    pending: Mutex<HashMap<Pid, PendingEntry, RandomState>>,
}

impl SigchldRegistry {
    /// Build the registry around a previously captured disposition
    ///
    /// The capture must predate the event loop's own SIGCHLD handler
    /// installation, so the caller performs it and hands in the snapshot.
    pub(crate) fn new(prior: PriorDisposition) -> Self {
        Self {
            prior,
            pending: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Associate a termination callback with a freshly spawned child
    ///
    /// An existing entry for the same pid means the OS reused the id before
    /// the stale registration was consumed; the new registration wins and
    /// the superseded token is cancelled so its callback can never fire.
    pub(crate) fn register(&self, pid: Pid, callback: TermCallback) -> WatchToken {
        let token = WatchToken::new();
        let entry = PendingEntry {
            callback,
            token: token.clone(),
        };
        if let Some(stale) = self.pending.lock().insert(pid, entry) {
            warn!(
                "Duplicate registration for pid {}: superseding stale entry",
                pid
            );
            stale.token.cancel();
        }
        debug!("Registered termination callback for pid {}", pid);
        token
    }

    /// Number of registrations awaiting termination
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Reap at most one child without blocking and route the result
    pub(crate) fn reap_once(&self) -> ReapOutcome {
        let mut raw: libc::c_int = 0;
        let flags = libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED;
        let pid = unsafe { libc::waitpid(-1, &mut raw, flags) };
        if pid == 0 {
            trace!("SIGCHLD wakeup with nothing reapable");
            return ReapOutcome::Spurious;
        }
        if pid < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ECHILD) {
                // Not attributable to any callback; log and move on.
                warn!("waitpid failed: {}", err);
            }
            return ReapOutcome::Spurious;
        }

        match WaitStatus::from_raw(nix::unistd::Pid::from_raw(pid), raw) {
            Ok(status) => {
                self.dispatch(pid, status, raw);
                ReapOutcome::Dispatched
            }
            Err(e) => {
                warn!("Undecodable wait status {:#x} for pid {}: {}", raw, pid, e);
                ReapOutcome::Spurious
            }
        }
    }

    /// Route one decoded child state change
    ///
    /// Foreign children go to the previous handler; stopped/continued
    /// children are dropped without consuming the registration; terminal
    /// states remove the entry before the callback runs so a second event
    /// for a since-reused pid can never reach a stale callback.
    pub(crate) fn dispatch(&self, pid: Pid, status: WaitStatus, raw: i32) {
        let Some((cause, result)) = decode_status(status) else {
            trace!("Ignoring ptrace-related status for pid {}", pid);
            return;
        };

        let entry = {
            let mut pending = self.pending.lock();
            if !pending.contains_key(&pid) {
                drop(pending);
                // Not a child registered with us; the previous owner of the
                // SIGCHLD slot still gets to see it.
                self.prior.forward(cause.as_cld_code(), pid, raw);
                return;
            }
            if !cause.is_terminal() {
                // Only termination is reported; the child is still alive,
                // so keep the registration and tell nobody.
                debug!("Child {} {:?}, keeping registration", pid, cause);
                return;
            }
            pending.remove(&pid)
        };

        if let Some(entry) = entry {
            if entry.token.is_cancelled() {
                debug!("Callback for pid {} was cancelled, dropping result", pid);
                return;
            }
            debug!(
                "Child {} terminated ({:?}): rc={} signal={}",
                pid, cause, result.return_code, result.signal
            );
            (entry.callback)(result.return_code, result.signal);
        }
    }
}

/// Run the SIGCHLD subscription for a registry
///
/// Each delivered notification triggers bounded reap passes: one child per
/// pass, yielding to the event loop between passes, stopping at the first
/// spurious result. Multiple children dying under a single coalesced signal
/// are therefore all drained without starving other event-loop work.
pub(crate) async fn run(registry: Arc<SigchldRegistry>, mut signal: Signal) {
    while signal.recv().await.is_some() {
        while registry.reap_once() == ReapOutcome::Dispatched {
            tokio::task::yield_now().await;
        }
    }
    debug!("SIGCHLD stream closed, termination registry stopping");
}

/// Decode a wait status into (cause, result)
///
/// Returns None for statuses this subsystem never routes (ptrace traps).
pub(crate) fn decode_status(status: WaitStatus) -> Option<(TerminationCause, Termination)> {
    match status {
        WaitStatus::Exited(_, code) => Some((TerminationCause::Exited, Termination::exited(code))),
        WaitStatus::Signaled(_, signal, core_dumped) => {
            let cause = if core_dumped {
                TerminationCause::Dumped
            } else {
                TerminationCause::Killed
            };
            Some((cause, Termination::killed(signal as i32)))
        }
        WaitStatus::Stopped(_, signal) => {
            Some((TerminationCause::Stopped, Termination::killed(signal as i32)))
        }
        WaitStatus::Continued(_) => Some((TerminationCause::Continued, Termination::exited(0))),
        // StillAlive is filtered out by the reap loop; ptrace statuses are
        // not child terminations at all.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal as NixSignal;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    static FORWARDED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_handler(_: libc::c_int) {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
    }

    fn nix_pid(pid: Pid) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(pid)
    }

    fn recording_callback(log: &Arc<StdMutex<Vec<(i32, i32)>>>) -> TermCallback {
        let log = Arc::clone(log);
        Box::new(move |rc, sig| log.lock().unwrap().push((rc, sig)))
    }

    #[test]
    fn test_decode_exited() {
        let status = WaitStatus::from_raw(nix_pid(1), 123 << 8).unwrap();
        let (cause, result) = decode_status(status).unwrap();
        assert_eq!(cause, TerminationCause::Exited);
        assert_eq!(result, Termination::exited(123));
    }

    #[test]
    fn test_decode_killed_by_signal() {
        let status = WaitStatus::from_raw(nix_pid(1), 9).unwrap();
        let (cause, result) = decode_status(status).unwrap();
        assert_eq!(cause, TerminationCause::Killed);
        assert_eq!(result.return_code, -1);
        assert_eq!(result.signal, 9);
    }

    #[test]
    fn test_exactly_once() {
        let registry = SigchldRegistry::new(PriorDisposition::Default);
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.register(100, recording_callback(&log));

        let exited = WaitStatus::Exited(nix_pid(100), 7);
        registry.dispatch(100, exited, 7 << 8);
        // A second event for the same (since-reused) pid must not hit the
        // consumed registration.
        registry.dispatch(100, exited, 7 << 8);

        assert_eq!(*log.lock().unwrap(), vec![(7, 0)]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_non_terminal_filtering() {
        let registry = SigchldRegistry::new(PriorDisposition::Default);
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.register(200, recording_callback(&log));

        registry.dispatch(200, WaitStatus::Stopped(nix_pid(200), NixSignal::SIGSTOP), 0);
        registry.dispatch(200, WaitStatus::Continued(nix_pid(200)), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.pending_count(), 1);

        registry.dispatch(200, WaitStatus::Exited(nix_pid(200), 0), 0);
        assert_eq!(*log.lock().unwrap(), vec![(0, 0)]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_foreign_child_forwarded() {
        FORWARDED.store(0, Ordering::SeqCst);
        let registry =
            SigchldRegistry::new(PriorDisposition::Handler(counting_handler));
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.register(300, recording_callback(&log));

        // Terminations for a pid we never spawned reach the prior handler,
        // not our callback.
        registry.dispatch(999, WaitStatus::Exited(nix_pid(999), 1), 1 << 8);
        assert_eq!(FORWARDED.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_killed_child_reports_signal() {
        let registry = SigchldRegistry::new(PriorDisposition::Default);
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.register(400, recording_callback(&log));

        registry.dispatch(
            400,
            WaitStatus::Signaled(nix_pid(400), NixSignal::SIGKILL, false),
            9,
        );
        assert_eq!(*log.lock().unwrap(), vec![(-1, 9)]);
    }

    #[test]
    fn test_cancelled_token_suppresses_callback() {
        let registry = SigchldRegistry::new(PriorDisposition::Default);
        let log = Arc::new(StdMutex::new(Vec::new()));
        let token = registry.register(500, recording_callback(&log));
        token.cancel();

        registry.dispatch(500, WaitStatus::Exited(nix_pid(500), 0), 0);
        assert!(log.lock().unwrap().is_empty());
        // The registration is still consumed: cancellation suppresses the
        // callback, not the reap bookkeeping.
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_registration_supersedes() {
        let registry = SigchldRegistry::new(PriorDisposition::Default);
        let first_log = Arc::new(StdMutex::new(Vec::new()));
        let second_log = Arc::new(StdMutex::new(Vec::new()));

        let first = registry.register(600, recording_callback(&first_log));
        let _second = registry.register(600, recording_callback(&second_log));

        assert!(first.is_cancelled());
        assert_eq!(registry.pending_count(), 1);

        registry.dispatch(600, WaitStatus::Exited(nix_pid(600), 3), 3 << 8);
        assert!(first_log.lock().unwrap().is_empty());
        assert_eq!(*second_log.lock().unwrap(), vec![(3, 0)]);
    }
}
