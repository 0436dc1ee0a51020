/*!
 * Handler-Chain Adapter
 * Captures the pre-existing SIGCHLD disposition and forwards foreign events to it
 */

use crate::types::Pid;
use log::{debug, warn};
use std::mem;
use std::ptr;

/// Simple-form signal handler, installed without SA_SIGINFO
pub type SimpleHandler = extern "C" fn(libc::c_int);

/// Extended-form signal handler, installed with SA_SIGINFO
pub type ExtendedHandler =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Snapshot of the SIGCHLD disposition that existed before this subsystem
/// took the signal over
///
/// Captured exactly once, before the event loop installs its own handler,
/// and never mutated afterwards. Every SIGCHLD not claimed by our own
/// children is replayed against this snapshot so co-resident code keeps
/// seeing the events it installed a handler for.
#[derive(Debug, Clone, Copy)]
pub enum PriorDisposition {
    /// SIG_DFL - nothing to forward to
    Default,
    /// SIG_IGN - previous owner asked for silence
    Ignored,
    /// Previous handler used the sa_handler calling convention
    Handler(SimpleHandler),
    /// Previous handler used sa_sigaction and expects a siginfo record
    Action(ExtendedHandler),
}

impl PriorDisposition {
    /// Read the current SIGCHLD disposition without installing anything
    ///
    /// Must run before the event loop's signal driver registers its own
    /// handler, otherwise the snapshot would capture the driver instead of
    /// the embedding application's handler.
    #[must_use]
    pub fn capture() -> Self {
        let mut prev = mem::MaybeUninit::<libc::sigaction>::zeroed();
        let rc = unsafe { libc::sigaction(libc::SIGCHLD, ptr::null(), prev.as_mut_ptr()) };
        if rc == -1 {
            warn!(
                "Could not query previous SIGCHLD disposition: {}",
                std::io::Error::last_os_error()
            );
            return Self::Default;
        }
        let prev = unsafe { prev.assume_init() };

        // SA_SIGINFO distinguishes the sa_handler and sa_sigaction forms
        if prev.sa_flags & libc::SA_SIGINFO != 0 {
            return Self::Action(unsafe { mem::transmute(prev.sa_sigaction) });
        }
        match prev.sa_sigaction {
            libc::SIG_DFL => Self::Default,
            libc::SIG_IGN => Self::Ignored,
            f => Self::Handler(unsafe { mem::transmute(f) }),
        }
    }

    /// Replay a child state-change event against the previous owner
    ///
    /// `cause` is the CLD_* code the kernel would have reported; `raw_status`
    /// is the undecoded wait status for the extended siginfo record.
    pub fn forward(&self, cause: i32, pid: Pid, raw_status: i32) {
        match self {
            Self::Default | Self::Ignored => {
                debug!("SIGCHLD for untracked pid {} has no previous handler", pid);
            }
            Self::Handler(f) => {
                debug!("Forwarding SIGCHLD for pid {} to previous handler", pid);
                f(libc::SIGCHLD);
            }
            Self::Action(f) => {
                debug!(
                    "Forwarding SIGCHLD for pid {} to previous sigaction handler",
                    pid
                );
                // The signal driver does not hand us the siginfo the real
                // handler would have received; synthesize an equivalent one.
                let mut info = synthesize_siginfo(cause, pid, raw_status);
                f(libc::SIGCHLD, &mut info, ptr::null_mut());
            }
        }
    }
}

/// Build the siginfo_t a SIGCHLD handler would have received
fn synthesize_siginfo(cause: i32, pid: Pid, raw_status: i32) -> libc::siginfo_t {
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    info.si_signo = libc::SIGCHLD;
    info.si_errno = 0;
    info.si_code = cause;

    // The CLD sifields (si_pid, si_uid, si_status) sit behind a private
    // union in libc; write them through the raw layout. On Linux the union
    // starts after the three header ints, padded to the union's alignment.
    #[cfg(target_os = "linux")]
    unsafe {
        let base = if cfg!(target_pointer_width = "64") { 4 } else { 3 };
        let words = &mut info as *mut libc::siginfo_t as *mut i32;
        *words.add(base) = pid;
        *words.add(base + 1) = nix::unistd::getuid().as_raw() as i32;
        *words.add(base + 2) = raw_status;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (pid, raw_status);

    info
}
