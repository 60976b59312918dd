//! # Staged Updates
//!
//! A new executable can be *staged* while the application is still running and applied
//! later. Staging parks a copy under the data directory and writes `pending_update.json`.
//! Applying waits for the application to be closed (same forced-close rule as an install),
//! swaps the executable, bumps the install record and relaunches.
//!
//! If closing is declined the pending update is kept for the next attempt.

use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use crate::fs_ops;
use crate::instances::{self, ClosePolicy};
use crate::manifest::parse_version;
use crate::record::{self, FileEntry};
use crate::system::SystemOps;

pub const PENDING_FILE_NAME: &str = "pending_update.json";
const REPLACE_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub new_exe_path: PathBuf,
    pub current_exe: PathBuf,
    pub new_version: String,
    /// Unix seconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    NothingPending,
    Applied { version: String, relaunched: bool },
}

pub fn pending_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PENDING_FILE_NAME)
}

fn staged_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("staged")
}

/// Copies `new_exe` into the staging area and records it as pending for `current_exe`.
/// A newer stage replaces an older one.
pub fn stage(data_dir: &Path, current_exe: &Path, new_exe: &Path, version: &str) -> Result<PendingUpdate> {
    if parse_version(version).is_none() {
        bail!("'{version}' is not a version");
    }
    if !new_exe.is_file() {
        bail!("staged executable not found: {}", new_exe.display());
    }
    let file_name = current_exe
        .file_name()
        .with_context(|| format!("{} has no file name", current_exe.display()))?;
    let dir = staged_dir(data_dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let staged = dir.join(file_name);
    fs_ops::copy_file_with_retry(new_exe, &staged, 3)?;

    let pending = PendingUpdate {
        new_exe_path: staged,
        current_exe: current_exe.to_path_buf(),
        new_version: version.trim().to_string(),
        timestamp: record::now_unix(),
    };
    let text = serde_json::to_string_pretty(&pending).context("serialize pending update")?;
    let path = pending_path(data_dir);
    std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
    info!("Staged {} {} for {:?}", file_name.to_string_lossy(), pending.new_version, current_exe);
    Ok(pending)
}

pub fn load(data_dir: &Path) -> Result<Option<PendingUpdate>> {
    let path = pending_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let pending = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(pending))
}

fn clear(data_dir: &Path, pending: &PendingUpdate) -> Result<()> {
    fs_ops::remove_file_forced(&pending.new_exe_path)?;
    fs_ops::remove_file_forced(&pending_path(data_dir))?;
    let staged = staged_dir(data_dir);
    fs_ops::prune_empty_dirs(&staged, &staged);
    Ok(())
}

/// Applies the pending update, if any.
pub fn apply(data_dir: &Path, system: &impl SystemOps, policy: ClosePolicy, relaunch: bool) -> Result<ApplyOutcome> {
    let Some(pending) = load(data_dir)? else {
        return Ok(ApplyOutcome::NothingPending);
    };
    if !pending.new_exe_path.is_file() {
        fs_ops::remove_file_forced(&pending_path(data_dir))?;
        bail!(
            "staged executable {} is missing, dropped the pending update",
            pending.new_exe_path.display()
        );
    }

    instances::ensure_not_running(system, &pending.current_exe, policy)?;

    info!("Replacing {:?} with version {}", pending.current_exe, pending.new_version);
    fs_ops::copy_file_with_retry(&pending.new_exe_path, &pending.current_exe, REPLACE_ATTEMPTS)?;
    update_record(&pending)?;
    clear(data_dir, &pending)?;

    if relaunch {
        system.launch(&pending.current_exe)?;
    }
    Ok(ApplyOutcome::Applied { version: pending.new_version, relaunched: relaunch })
}

/// Keeps the install record in line with the swapped executable, when there is one.
fn update_record(pending: &PendingUpdate) -> Result<()> {
    let Some(root) = pending.current_exe.parent() else {
        return Ok(());
    };
    let Some(mut rec) = record::read_record(root)? else {
        return Ok(());
    };
    let exe_name = pending
        .current_exe
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if !rec.executable.eq_ignore_ascii_case(&exe_name) {
        warn!("Install record at {:?} is for {}, leaving it alone", root, rec.executable);
        return Ok(());
    }
    let (size, source_modified) = fs_ops::stat(&pending.new_exe_path)?;
    let entry = FileEntry { path: rec.executable.clone(), size, source_modified };
    match rec.files.iter_mut().find(|f| f.path.eq_ignore_ascii_case(&entry.path)) {
        Some(existing) => *existing = entry,
        None => rec.files.push(entry),
    }
    rec.version = pending.new_version.clone();
    record::write_record(root, &rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::error::InstallError;
    use crate::record::InstallRecord;
    use crate::system::{MockSystem, RegistryScope};

    struct Fixture {
        _tmp: tempfile::TempDir,
        data: PathBuf,
        root: PathBuf,
        download: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let root = tmp.path().join("HelloApp");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("HelloApp.exe"), "old").unwrap();
        record::write_record(
            &root,
            &InstallRecord {
                app_id: "{ABC}".into(),
                name: "HelloApp".into(),
                version: "1.0.0".into(),
                scope: RegistryScope::User,
                executable: "HelloApp.exe".into(),
                payload_dir: None,
                files: vec![FileEntry { path: "HelloApp.exe".into(), size: 3, source_modified: 0 }],
                associations: vec![],
                shortcuts: vec![],
                installed_at: 0,
            },
        )
        .unwrap();
        let download = tmp.path().join("hello_new.exe");
        fs::write(&download, "brand new").unwrap();
        Fixture { data, root, download, _tmp: tmp }
    }

    #[test]
    fn nothing_staged_is_a_no_op() {
        let f = fixture();
        let out = apply(&f.data, &MockSystem::new(), ClosePolicy::Always, true).unwrap();
        assert_eq!(out, ApplyOutcome::NothingPending);
    }

    #[test]
    fn staged_update_replaces_exe_and_bumps_record() {
        let f = fixture();
        let exe = f.root.join("HelloApp.exe");
        stage(&f.data, &exe, &f.download, "1.1.0").unwrap();
        let mock = MockSystem::new();

        let out = apply(&f.data, &mock, ClosePolicy::Ask, true).unwrap();

        assert_eq!(out, ApplyOutcome::Applied { version: "1.1.0".into(), relaunched: true });
        assert_eq!(fs::read_to_string(&exe).unwrap(), "brand new");
        let rec = record::read_record(&f.root).unwrap().unwrap();
        assert_eq!(rec.version, "1.1.0");
        assert_eq!(rec.files[0].size, 9);
        assert!(load(&f.data).unwrap().is_none());
        assert!(!f.data.join("staged").exists());
        assert_eq!(*mock.launched.lock().unwrap(), vec![exe]);
    }

    #[test]
    fn declined_close_keeps_exe_and_pending_update() {
        let f = fixture();
        let exe = f.root.join("HelloApp.exe");
        stage(&f.data, &exe, &f.download, "1.1.0").unwrap();
        let mock = MockSystem::with_running(&exe, &[99]);

        let err = apply(&f.data, &mock, ClosePolicy::Ask, true).unwrap_err();

        assert!(matches!(err.downcast_ref::<InstallError>(), Some(InstallError::CloseDenied { .. })));
        assert_eq!(fs::read_to_string(&exe).unwrap(), "old");
        assert!(load(&f.data).unwrap().is_some());
        assert!(mock.launched.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_staged_file_drops_pending() {
        let f = fixture();
        let exe = f.root.join("HelloApp.exe");
        let pending = stage(&f.data, &exe, &f.download, "1.1.0").unwrap();
        fs::remove_file(&pending.new_exe_path).unwrap();

        assert!(apply(&f.data, &MockSystem::new(), ClosePolicy::Always, false).is_err());
        assert!(load(&f.data).unwrap().is_none());
        assert_eq!(fs::read_to_string(&exe).unwrap(), "old");
    }

    #[test]
    fn stage_rejects_bad_version() {
        let f = fixture();
        let err = stage(&f.data, &f.root.join("HelloApp.exe"), &f.download, "latest").unwrap_err();
        assert!(err.to_string().contains("not a version"));
    }
}
