//! Child-process termination
//!
//! Driver destruction must not trust `quit()` alone: crashed sessions leave
//! browser and control processes behind. PIDs recorded at creation are
//! escalated SIGTERM -> bounded wait -> SIGKILL, and `close_all` finishes
//! with a sweep over residual same-user processes matching the browser or
//! driver executable names.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, Signal, System};
use tracing::{debug, warn};

/// How long a terminated process gets to exit before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Poll spacing while waiting out the grace period.
const TERM_POLL: Duration = Duration::from_millis(100);

/// Terminate the given PIDs, escalating to SIGKILL after [`TERM_GRACE`].
/// Returns the number of PIDs that could not be brought down.
pub async fn terminate_pids(pids: &[u32]) -> usize {
    let mut failures = 0;
    let mut sys = System::new();

    for &raw in pids {
        let pid = Pid::from_u32(raw);
        if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            debug!(pid = raw, "process already gone");
            continue;
        }
        let Some(process) = sys.process(pid) else {
            continue;
        };

        if process.kill_with(Signal::Term).is_none() {
            // platform without SIGTERM support
            process.kill();
        }

        let mut exited = false;
        let deadline = tokio::time::Instant::now() + TERM_GRACE;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(TERM_POLL).await;
            if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
                exited = true;
                break;
            }
        }

        if exited {
            debug!(pid = raw, "process terminated");
            continue;
        }

        if let Some(process) = sys.process(pid) {
            process.kill_with(Signal::Kill);
        }
        tokio::time::sleep(TERM_POLL).await;
        if sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            warn!(pid = raw, "process survived SIGKILL");
            failures += 1;
        } else {
            debug!(pid = raw, "process killed");
        }
    }

    failures
}

/// Terminate residual processes owned by the current user whose executable
/// matches one of `names`. Returns how many processes were signalled.
pub async fn sweep_residual(names: &[String]) -> usize {
    if names.is_empty() {
        return 0;
    }

    let mut sys = System::new();
    sys.refresh_processes();

    let Ok(current_pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let my_uid = sys
        .process(current_pid)
        .and_then(|p| p.user_id())
        .cloned();

    let mut swept = Vec::new();
    for (pid, process) in sys.processes() {
        if *pid == current_pid {
            continue;
        }
        // sysinfo may truncate long executable names, so match on prefix
        // in either direction.
        let name = process.name();
        let matches = names
            .iter()
            .any(|n| name.starts_with(n.as_str()) || n.starts_with(name));
        if !matches {
            continue;
        }
        if let Some(my_uid) = &my_uid {
            if process.user_id() != Some(my_uid) {
                continue;
            }
        }
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
        swept.push(pid.as_u32());
    }

    if swept.is_empty() {
        return 0;
    }

    // give the herd a moment, then put down survivors
    tokio::time::sleep(Duration::from_millis(500)).await;
    sys.refresh_processes();
    for raw in &swept {
        if let Some(process) = sys.process(Pid::from_u32(*raw)) {
            process.kill_with(Signal::Kill);
        }
    }

    warn!(count = swept.len(), "swept residual browser processes");
    swept.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminating_dead_pids_is_a_noop() {
        // PIDs far outside the live range: nothing to kill, no failures.
        let failures = terminate_pids(&[3_999_999, 3_999_998]).await;
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn empty_sweep_is_free() {
        assert_eq!(sweep_residual(&[]).await, 0);
    }

    #[tokio::test]
    async fn sweep_with_unmatched_name_touches_nothing() {
        let swept = sweep_residual(&["no-such-executable-name-xyz".to_string()]).await;
        assert_eq!(swept, 0);
    }
}
