/*!
 * Termination Types
 * Process identity, decoded termination results, and notification errors
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// OS-assigned process identifier
///
/// Unique among live processes, reused by the OS after the child is reaped.
pub type Pid = i32;

/// Notification operation result
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Notification errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum NotifyError {
    #[error("Termination-signal subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Registry not active: call ensure_active() before registering")]
    NotActive,

    #[error("Handle duplication failed: {0}")]
    DuplicateHandle(String),
}

/// Caller-supplied termination callback
///
/// Invoked at most once with `(return_code, signal)`. A normal exit yields
/// `(code, 0)`; a child killed by a signal yields `(-1, signal)`. When
/// `signal != 0` it is authoritative over `return_code == -1`.
pub type TermCallback = Box<dyn FnOnce(i32, i32) + Send>;

/// Why a child changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationCause {
    /// Exited normally via exit() or returning from main
    Exited,
    /// Killed by a signal
    Killed,
    /// Killed by a signal and dumped core
    Dumped,
    /// Stopped by a signal, still alive
    Stopped,
    /// Resumed by SIGCONT, still alive
    Continued,
}

impl TerminationCause {
    /// True for the causes that actually end the process
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Dumped)
    }

    /// The si_code value a SIGCHLD siginfo would carry for this cause
    #[cfg(unix)]
    #[must_use]
    pub fn as_cld_code(&self) -> i32 {
        match self {
            Self::Exited => libc::CLD_EXITED,
            Self::Killed => libc::CLD_KILLED,
            Self::Dumped => libc::CLD_DUMPED,
            Self::Stopped => libc::CLD_STOPPED,
            Self::Continued => libc::CLD_CONTINUED,
        }
    }
}

/// Decoded termination result delivered to callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub return_code: i32,
    pub signal: i32,
}

impl Termination {
    /// Normal exit with the given code
    #[inline]
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            return_code: code,
            signal: 0,
        }
    }

    /// Abnormal termination by the given signal
    ///
    /// return_code defaults to -1 so a callback is never fooled into
    /// thinking the child terminated normally.
    #[inline]
    #[must_use]
    pub fn killed(signal: i32) -> Self {
        Self {
            return_code: -1,
            signal,
        }
    }

    /// Decode a Win32 process exit code
    ///
    /// The high-order bit clear means voluntary termination; Windows
    /// produces large values (0xCnnnnnnn) when a process terminates badly,
    /// which map into the signal slot of the shared convention.
    #[must_use]
    pub fn from_exit_code(code: u32) -> Self {
        if code & 0x8000_0000 == 0 {
            Self::exited(code as i32)
        } else {
            Self::killed(code as i32)
        }
    }
}

/// Cancellation token returned from registration
///
/// Cancelling does not un-reap the child; it only prevents the callback
/// from running if the owning code has been torn down first.
#[derive(Debug, Clone)]
pub struct WatchToken {
    cancelled: Arc<AtomicBool>,
}

impl WatchToken {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prevent the associated callback from ever firing
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Minimal identity of a freshly created child process
///
/// Handed from the process-creation flow to the post-creation hook: the
/// OS pid, plus the native process handle where the platform reports
/// termination through a waitable object instead of a signal.
#[derive(Debug, Clone, Copy)]
pub struct ChildHandle {
    pid: Pid,
    #[cfg(windows)]
    raw: isize,
}

impl ChildHandle {
    #[cfg(unix)]
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    #[cfg(windows)]
    #[must_use]
    pub fn new(pid: Pid, raw: isize) -> Self {
        Self { pid, raw }
    }

    #[inline]
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Native waitable process handle
    #[cfg(windows)]
    #[inline]
    #[must_use]
    pub fn raw_handle(&self) -> isize {
        self.raw
    }
}

impl From<&std::process::Child> for ChildHandle {
    #[cfg(unix)]
    fn from(child: &std::process::Child) -> Self {
        Self::new(child.id() as Pid)
    }

    #[cfg(windows)]
    fn from(child: &std::process::Child) -> Self {
        use std::os::windows::io::AsRawHandle;
        Self::new(child.id() as Pid, child.as_raw_handle() as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exit_code_decoding() {
        // Voluntary termination routes to the return-code slot
        assert_eq!(Termination::from_exit_code(0x0000_0007), Termination::exited(7));
        assert_eq!(Termination::from_exit_code(0), Termination::exited(0));

        // Top bit set routes to the signal slot
        let bad = Termination::from_exit_code(0xC000_0005);
        assert_eq!(bad.return_code, -1);
        assert_eq!(bad.signal, 0xC000_0005_u32 as i32);
    }

    #[test]
    fn test_cause_terminality() {
        assert!(TerminationCause::Exited.is_terminal());
        assert!(TerminationCause::Killed.is_terminal());
        assert!(TerminationCause::Dumped.is_terminal());
        assert!(!TerminationCause::Stopped.is_terminal());
        assert!(!TerminationCause::Continued.is_terminal());
    }

    #[cfg(unix)]
    #[test]
    fn test_cld_codes() {
        assert_eq!(TerminationCause::Exited.as_cld_code(), libc::CLD_EXITED);
        assert_eq!(TerminationCause::Killed.as_cld_code(), libc::CLD_KILLED);
        assert_eq!(TerminationCause::Dumped.as_cld_code(), libc::CLD_DUMPED);
        assert_eq!(TerminationCause::Stopped.as_cld_code(), libc::CLD_STOPPED);
        assert_eq!(
            TerminationCause::Continued.as_cld_code(),
            libc::CLD_CONTINUED
        );
    }

    #[test]
    fn test_watch_token() {
        let token = WatchToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
