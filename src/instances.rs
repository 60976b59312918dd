//! Running-instance handling.
//!
//! Files of a running executable are mapped and locked on Windows. Before anything under
//! the install root is replaced, every process started from the target executable is
//! force-closed. If the user says no, or a process survives the kill, the caller gets an
//! error and must not touch the files.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Result;
use log::{info, warn};
use crate::error::InstallError;
use crate::invariants::{assert_invariant, NO_REPLACE_WHILE_RUNNING};
use crate::system::SystemOps;

const EXIT_POLLS: usize = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How to answer the "close the running application?" question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Prompt the user.
    #[default]
    Ask,
    /// Close without asking (`--yes`).
    Always,
    /// Never close (`--no-close`). A running instance aborts the operation.
    Never,
}

/// What was closed, so it can be relaunched after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedInstances {
    pub exe: PathBuf,
    pub count: usize,
}

impl ClosedInstances {
    pub fn any(&self) -> bool {
        self.count > 0
    }
}

/// Makes sure `exe` is not running, closing it if the policy allows.
pub fn ensure_not_running(system: &impl SystemOps, exe: &Path, policy: ClosePolicy) -> Result<ClosedInstances> {
    let pids = system.running_instances(exe)?;
    if pids.is_empty() {
        assert_invariant(true, NO_REPLACE_WHILE_RUNNING, Some("Instances"));
        return Ok(ClosedInstances { exe: exe.to_path_buf(), count: 0 });
    }

    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| exe.display().to_string());
    let allowed = match policy {
        ClosePolicy::Always => true,
        ClosePolicy::Never => false,
        ClosePolicy::Ask => system.confirm(&format!(
            "{name} is running ({} instance(s)). Close it to continue?",
            pids.len()
        )),
    };
    if !allowed {
        warn!("{} is running and closing it was declined", name);
        return Err(InstallError::CloseDenied { exe: name }.into());
    }

    info!("Closing {} instance(s) of {}", pids.len(), name);
    for pid in &pids {
        if let Err(e) = system.terminate_process(*pid) {
            warn!("Failed to terminate pid {}: {:#}", pid, e);
        }
    }

    let mut remaining = system.running_instances(exe)?;
    for _ in 0..EXIT_POLLS {
        if remaining.is_empty() {
            break;
        }
        system.sleep(EXIT_POLL_INTERVAL);
        remaining = system.running_instances(exe)?;
    }
    if !remaining.is_empty() {
        return Err(InstallError::CloseFailed { exe: name, remaining: remaining.len() }.into());
    }

    assert_invariant(true, NO_REPLACE_WHILE_RUNNING, Some("Instances"));
    Ok(ClosedInstances { exe: exe.to_path_buf(), count: pids.len() })
}
