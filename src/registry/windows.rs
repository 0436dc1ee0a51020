/*!
 * Handle-Model Termination Registry
 * Per-process asynchronous wait on a duplicated Win32 process handle
 */

use crate::types::{ChildHandle, NotifyError, NotifyResult, TermCallback, Termination, WatchToken};
use log::{debug, warn};
use tokio::runtime::Handle;
use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetExitCodeProcess, WaitForSingleObject, INFINITE,
};

/// Start an asynchronous wait for a child's termination
///
/// The native handle is duplicated so its lifetime is independent of any
/// handle the creation flow closes; duplication failure means the watch
/// cannot exist and is reported synchronously. Termination arrives as one
/// level-triggered signaled transition, so there is no process-wide
/// registry or handler chain here: every child carries its own waitable
/// object.
pub(crate) fn watch(
    event_loop: &Handle,
    child: &ChildHandle,
    callback: TermCallback,
) -> NotifyResult<WatchToken> {
    let mut duplicated: HANDLE = 0;
    let ok = unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            child.raw_handle() as HANDLE,
            GetCurrentProcess(),
            &mut duplicated,
            0, // new access, ignored with DUPLICATE_SAME_ACCESS
            0, // non-inheritable
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        return Err(NotifyError::DuplicateHandle(
            std::io::Error::last_os_error().to_string(),
        ));
    }

    let token = WatchToken::new();
    let watch_token = token.clone();
    let pid = child.pid();
    debug!("Watching process handle for pid {}", pid);

    event_loop.spawn(async move {
        // The kernel wait is blocking; park it on the blocking pool and
        // resume on the event loop once the handle signals.
        let exit_code = tokio::task::spawn_blocking(move || {
            let signaled = unsafe { WaitForSingleObject(duplicated, INFINITE) };
            let code = if signaled == WAIT_OBJECT_0 {
                let mut code: u32 = 0;
                let got = unsafe { GetExitCodeProcess(duplicated, &mut code) };
                (got != 0).then_some(code)
            } else {
                None
            };
            unsafe { CloseHandle(duplicated) };
            code
        })
        .await;

        // Whether or not the exit code was retrievable, the callback fires;
        // an unqueryable status degrades to the abnormal-termination shape.
        let result = match exit_code {
            Ok(Some(code)) => Termination::from_exit_code(code),
            Ok(None) => {
                warn!("Could not query exit code for pid {}", pid);
                Termination {
                    return_code: -1,
                    signal: 0,
                }
            }
            Err(e) => {
                warn!("Handle wait for pid {} failed: {}", pid, e);
                Termination {
                    return_code: -1,
                    signal: 0,
                }
            }
        };

        if watch_token.is_cancelled() {
            debug!("Callback for pid {} was cancelled, dropping result", pid);
            return;
        }
        debug!(
            "Child {} terminated: rc={} signal={:#x}",
            pid, result.return_code, result.signal
        );
        callback(result.return_code, result.signal);
    });

    Ok(token)
}
