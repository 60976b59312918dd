//! # Payload Module
//!
//! Moves the build output into the install root: the executable plus its runtime payload
//! directory. The build step is a black box; all we rely on is the layout
//! `<source_dir>\<exe>` and `<source_dir>\<payload_dir>\**`.
//!
//! Files whose source is unchanged since the recorded install (same size and modification
//! time, destination still present with the same size) are skipped. Everything else is
//! replaced through a temp file, read-only attribute or not.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use walkdir::WalkDir;
use crate::fs_ops;
use crate::manifest::Manifest;
use crate::record::FileEntry;

const COPY_ATTEMPTS: usize = 5;

/// One file of the build output.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub source: PathBuf,
    pub entry: FileEntry,
}

/// What an install would do with one file.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub file: SourceFile,
    pub skip: bool,
}

#[derive(Debug, Default)]
pub struct CopyReport {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
    pub files: Vec<FileEntry>,
}

fn relative_key(path: &Path, base: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is outside {}", path.display(), base.display()))?;
    let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
    Ok(parts.join("/"))
}

/// Lists the executable and every file under the payload directory.
pub fn collect_sources(manifest: &Manifest) -> Result<Vec<SourceFile>> {
    let exe = manifest.source_executable();
    if !exe.is_file() {
        bail!("executable not found in build output: {}", exe.display());
    }
    let mut files = vec![source_file(&exe, &manifest.source_dir)?];

    if let Some(payload) = manifest.source_payload() {
        if !payload.is_dir() {
            bail!("payload directory not found in build output: {}", payload.display());
        }
        for entry in WalkDir::new(&payload).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", payload.display()))?;
            if entry.file_type().is_file() {
                files.push(source_file(entry.path(), &manifest.source_dir)?);
            }
        }
    }
    debug!("Build output has {} files", files.len());
    Ok(files)
}

fn source_file(path: &Path, base: &Path) -> Result<SourceFile> {
    let (size, source_modified) = fs_ops::stat(path)?;
    Ok(SourceFile {
        source: path.to_path_buf(),
        entry: FileEntry {
            path: relative_key(path, base)?,
            size,
            source_modified,
        },
    })
}

/// Decides per file whether it has to be copied again.
pub fn plan(sources: Vec<SourceFile>, root: &Path, previous: &[FileEntry]) -> Vec<PlannedFile> {
    sources
        .into_iter()
        .map(|file| {
            let unchanged = previous
                .iter()
                .find(|p| p.path.eq_ignore_ascii_case(&file.entry.path))
                .is_some_and(|p| p.size == file.entry.size && p.source_modified == file.entry.source_modified);
            let dest = file.entry.absolute(root);
            let present = std::fs::metadata(&dest).map(|m| m.len() == file.entry.size).unwrap_or(false);
            PlannedFile { skip: unchanged && present, file }
        })
        .collect()
}

/// Copies every planned file that is not skipped.
pub fn copy_planned(planned: &[PlannedFile], root: &Path) -> Result<CopyReport> {
    let mut report = CopyReport::default();
    for item in planned {
        let rel = item.file.entry.path.clone();
        report.files.push(item.file.entry.clone());
        if item.skip {
            debug!("Unchanged, skipping {}", rel);
            report.skipped.push(rel);
            continue;
        }
        let dest = item.file.entry.absolute(root);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs_ops::copy_file_with_retry(&item.file.source, &dest, COPY_ATTEMPTS)?;
        debug!("Copied {}", rel);
        report.copied.push(rel);
    }
    info!("Copied {} files, {} unchanged", report.copied.len(), report.skipped.len());
    Ok(report)
}

/// Deletes files of the old install that the new version no longer ships.
pub fn remove_stale(root: &Path, old: &[FileEntry], new: &[FileEntry]) -> Result<Vec<String>> {
    let keep: HashSet<String> = new.iter().map(|f| f.path.to_lowercase()).collect();
    let mut removed = Vec::new();
    for entry in old.iter().filter(|f| !keep.contains(&f.path.to_lowercase())) {
        let path = entry.absolute(root);
        fs_ops::remove_file_forced(&path)?;
        if let Some(parent) = path.parent() {
            fs_ops::prune_empty_dirs(parent, root);
        }
        removed.push(entry.path.clone());
    }
    if !removed.is_empty() {
        info!("Removed {} files dropped by this version", removed.len());
    }
    Ok(removed)
}

/// Deletes every recorded file and the directories that become empty, the root included.
/// Anything not in `files` stays.
pub fn remove_installed(root: &Path, files: &[FileEntry]) -> Result<()> {
    for entry in files {
        let path = entry.absolute(root);
        fs_ops::remove_file_forced(&path)?;
        if let Some(parent) = path.parent() {
            fs_ops::prune_empty_dirs(parent, root);
        }
    }
    Ok(())
}

/// Lays out a small frozen-app build output (`HelloApp.exe` + `_internal`).
#[cfg(test)]
pub(crate) fn write_build_output(dir: &Path) {
    use std::fs;
    fs::create_dir_all(dir.join("_internal").join("lib")).unwrap();
    fs::write(dir.join("HelloApp.exe"), "exe v1").unwrap();
    fs::write(dir.join("_internal").join("python3.dll"), "python").unwrap();
    fs::write(dir.join("_internal").join("lib").join("core.pyd"), "core").unwrap();
}
