//! # Install Record
//!
//! `hearth-install.json` in the install root lists exactly what an install created: the
//! files with the metadata used to skip unchanged ones, the registered associations and the
//! shortcuts. Upgrades diff against it and uninstall undoes it, so nothing the installer
//! did not create is ever removed.

use std::path::{Component, Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::associations::RegisteredAssociation;
use crate::system::RegistryScope;

pub const RECORD_FILE_NAME: &str = "hearth-install.json";

/// One installed file. `path` is relative to the install root with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    /// Modification time (unix seconds) of the *source* file this was copied from.
    pub source_modified: u64,
}

impl FileEntry {
    pub fn absolute(&self, root: &Path) -> PathBuf {
        self.path.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }

    /// `false` for anything that would resolve outside the install root (`..`, drives, roots).
    pub fn is_contained(&self) -> bool {
        !self.path.is_empty() && self.path.split('/').all(is_plain_name)
    }
}

fn is_plain_name(part: &str) -> bool {
    let mut components = Path::new(part).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
        && !part.contains(['\\', ':'])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub scope: RegistryScope,
    pub executable: String,
    #[serde(default)]
    pub payload_dir: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub associations: Vec<RegisteredAssociation>,
    #[serde(default)]
    pub shortcuts: Vec<PathBuf>,
    /// Unix seconds.
    #[serde(default)]
    pub installed_at: u64,
}

pub fn record_path(root: &Path) -> PathBuf {
    root.join(RECORD_FILE_NAME)
}

/// Reads the record of `root`. `Ok(None)` if nothing was installed there.
pub fn read_record(root: &Path) -> Result<Option<InstallRecord>> {
    let path = record_path(root);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let record: InstallRecord =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    if !is_plain_name(&record.executable) {
        bail!("{} names executable '{}' outside the install root", path.display(), record.executable);
    }
    if let Some(bad) = record.files.iter().find(|f| !f.is_contained()) {
        bail!("{} lists '{}' outside the install root", path.display(), bad.path);
    }
    Ok(Some(record))
}

pub fn write_record(root: &Path, record: &InstallRecord) -> Result<()> {
    let path = record_path(root);
    let text = serde_json::to_string_pretty(record).context("serialize install record")?;
    crate::fs_ops::retry(
        || std::fs::write(&path, &text).with_context(|| format!("write {}", path.display())),
        3,
    )
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallRecord {
        InstallRecord {
            app_id: "{ABC}".into(),
            name: "HelloApp".into(),
            version: "1.0.0".into(),
            scope: RegistryScope::User,
            executable: "HelloApp.exe".into(),
            payload_dir: Some("_internal".into()),
            files: vec![FileEntry { path: "_internal/lib/core.dll".into(), size: 4, source_modified: 7 }],
            associations: vec![],
            shortcuts: vec![],
            installed_at: 1,
        }
    }

    #[test]
    fn missing_record_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_record(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn written_record_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(tmp.path(), &sample()).unwrap();
        assert_eq!(read_record(tmp.path()).unwrap(), Some(sample()));
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(record_path(tmp.path()), "{ not json").unwrap();
        let err = read_record(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[test]
    fn escaping_entries_are_rejected() {
        for bad in ["../settings.json", "_internal/../../x", "/etc/passwd", "C:/Windows/x.dll", r"..\x", ""] {
            let entry = FileEntry { path: bad.into(), size: 1, source_modified: 0 };
            assert!(!entry.is_contained(), "{bad:?} accepted");
        }
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = sample();
        rec.files.push(FileEntry { path: "../outside.txt".into(), size: 1, source_modified: 0 });
        write_record(tmp.path(), &rec).unwrap();
        let err = read_record(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("outside the install root"));
    }

    #[test]
    fn entries_resolve_under_root() {
        let root = Path::new("install");
        let rec = sample();
        assert_eq!(rec.files[0].absolute(root), root.join("_internal").join("lib").join("core.dll"));
    }
}
