//! Child-process teardown helpers shared by the process-backed backends.

use std::time::Duration;

use tokio::process::Child;

/// Bound on how long a child gets between SIGTERM and a hard kill.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_millis(1500);

/// Sends SIGTERM to a child (`kill -TERM <pid>`). On non-unix platforms this
/// degrades to a hard kill request.
pub(crate) fn send_sigterm(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status();
            return;
        }
    }
    let _ = child.start_kill();
}

/// Terminates a child gracefully: SIGTERM, bounded wait, then hard kill.
/// Errors are swallowed; teardown is best-effort on every exit path.
pub(crate) async fn shutdown_child(child: &mut Child) {
    if child.try_wait().ok().flatten().is_some() {
        return;
    }
    send_sigterm(child);
    if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}
