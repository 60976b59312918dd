use anyhow::{bail, Context, Result};
use log::warn;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, UNIX_EPOCH},
};

const FIRST_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(2);

static STAGING_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Pauses between attempts: 200ms, doubling, capped at 2s.
fn backoff() -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(FIRST_DELAY), |d| Some((*d * 2).min(MAX_DELAY)))
}

/// Runs `op` until it succeeds or `attempts` runs failed. The last error is returned.
pub fn retry<F>(mut op: F, attempts: usize) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let mut delays = backoff();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                let delay = delays.next().unwrap_or(MAX_DELAY);
                warn!("attempt {attempt}/{attempts} failed, retrying in {delay:?}: {err:#}");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Hidden sibling of `dest` that no other copy of this process writes to.
fn staging_path(dest: &Path) -> Result<PathBuf> {
    let (Some(dir), Some(name)) = (dest.parent(), dest.file_name()) else {
        bail!("{} is not a file path", dest.display());
    };
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(dir.join(format!(".{}.hearth-{}-{n}.part", name.to_string_lossy(), std::process::id())))
}

/// Drops the read-only attribute so the file can be replaced or deleted.
pub fn clear_readonly(path: &Path) -> Result<()> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
            .with_context(|| format!("clear read-only {}", path.display()))?;
    }
    Ok(())
}

/// Removes a file even if it is read-only. Missing files are fine.
pub fn remove_file_forced(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    clear_readonly(path)?;
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
}

/// Copies through a sibling temp file so `dest` is either the old or the new content.
fn copy_file_atomic(src: &Path, dest: &Path) -> Result<()> {
    let tmp = staging_path(dest)?;
    fs::copy(src, &tmp)
        .with_context(|| format!("copy {} -> {}", src.display(), tmp.display()))?;
    // A fresh copy of a read-only source is read-only as well.
    clear_readonly(&tmp)?;
    if let Err(err) = remove_file_forced(dest) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, dest)
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    Ok(())
}

pub fn copy_file_with_retry(src: &Path, dest: &Path, attempts: usize) -> Result<()> {
    retry(|| copy_file_atomic(src, dest), attempts)
}

/// File size and modification time (unix seconds).
pub fn stat(path: &Path) -> Result<(u64, u64)> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok((meta.len(), modified))
}

/// Removes empty directories from `start` upwards, stopping at (and including) `stop`.
pub fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if !dir.starts_with(stop) {
            break;
        }
        let is_empty = fs::read_dir(dir).map(|mut it| it.next().is_none()).unwrap_or(false);
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        if dir == stop {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn copy_file_with_retry_copies_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        let mut f = fs::File::create(&src).unwrap();
        writeln!(f, "hello").unwrap();

        copy_file_with_retry(&src, &dest, 3).unwrap();

        let out = fs::read_to_string(&dest).unwrap();
        assert!(out.contains("hello"));
    }

    #[test]
    fn copy_overwrites_read_only_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("new.dll");
        let dest = tmp.path().join("old.dll");
        fs::write(&src, "new").unwrap();
        fs::write(&dest, "old").unwrap();
        let mut perms = fs::metadata(&dest).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&dest, perms).unwrap();

        copy_file_with_retry(&src, &dest, 1).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "new");
        assert!(!fs::metadata(&dest).unwrap().permissions().readonly());
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let mut calls = 0;
        let res = retry(
            || {
                calls += 1;
                anyhow::bail!("locked")
            },
            2,
        );
        assert!(res.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let delays: Vec<u64> = backoff().take(6).map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 2000, 2000]);
    }

    #[test]
    fn staging_paths_are_unique_siblings() {
        let dest = Path::new("install").join("HelloApp.exe");
        let a = staging_path(&dest).unwrap();
        let b = staging_path(&dest).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
    }

    #[test]
    fn prune_stops_at_non_empty_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let deep = root.join("a").join("b");
        fs::create_dir_all(&deep).unwrap();
        fs::write(root.join("keep.txt"), "user data").unwrap();

        prune_empty_dirs(&deep, &root);

        assert!(!root.join("a").exists());
        assert!(root.join("keep.txt").exists());
    }
}
