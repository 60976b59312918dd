//! Well-known locations, resolved per registry scope.
//!
//! | scope   | install root                         | start menu                                   | desktop          |
//! |---------|--------------------------------------|----------------------------------------------|------------------|
//! | Machine | `%ProgramFiles%\<dir>`               | `%ProgramData%\Microsoft\Windows\Start Menu\Programs` | `%PUBLIC%\Desktop` |
//! | User    | `%LOCALAPPDATA%\Programs\<dir>`      | `%APPDATA%\Microsoft\Windows\Start Menu\Programs`    | user desktop     |

use anyhow::{bail, Context, Result};
use directories::{ProjectDirs, UserDirs};
use std::path::{Path, PathBuf};
use crate::system::RegistryScope;

/// Everything an install writes outside the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub start_menu: PathBuf,
    pub desktop: PathBuf,
}

impl Layout {
    /// Resolves the layout for `scope`. `root_override` replaces the default install root.
    pub fn resolve(scope: RegistryScope, dir_name: &str, root_override: Option<&Path>) -> Result<Self> {
        let root = match root_override {
            Some(dir) => dir.to_path_buf(),
            None => default_install_root(scope, dir_name)?,
        };
        Ok(Self {
            root,
            start_menu: start_menu_dir(scope)?,
            desktop: desktop_dir(scope)?,
        })
    }
}

fn env_dir(var: &str) -> Result<PathBuf> {
    let value = std::env::var(var).with_context(|| format!("{var} not set"))?;
    Ok(PathBuf::from(value))
}

pub fn default_install_root(scope: RegistryScope, dir_name: &str) -> Result<PathBuf> {
    if dir_name.trim().is_empty() {
        bail!("install directory name is empty");
    }
    let base = match scope {
        RegistryScope::Machine => env_dir("ProgramFiles")?,
        RegistryScope::User => env_dir("LOCALAPPDATA")?.join("Programs"),
    };
    Ok(base.join(dir_name))
}

pub fn start_menu_dir(scope: RegistryScope) -> Result<PathBuf> {
    let base = match scope {
        RegistryScope::Machine => env_dir("ProgramData")?,
        RegistryScope::User => env_dir("APPDATA")?,
    };
    Ok(base.join("Microsoft").join("Windows").join("Start Menu").join("Programs"))
}

pub fn desktop_dir(scope: RegistryScope) -> Result<PathBuf> {
    match scope {
        RegistryScope::Machine => Ok(env_dir("PUBLIC")?.join("Desktop")),
        RegistryScope::User => {
            if let Some(desktop) = UserDirs::new().and_then(|u| u.desktop_dir().map(Path::to_path_buf)) {
                return Ok(desktop);
            }
            Ok(env_dir("USERPROFILE")?.join("Desktop"))
        }
    }
}

/// Hearth's own data directory (logs, staged updates). `HEARTH_DATA_DIR` overrides it.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("HEARTH_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let dirs = ProjectDirs::from("", "", "Hearth").context("no home directory for the data dir")?;
    Ok(dirs.data_local_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn with_env<T>(var: &str, value: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let prior = std::env::var_os(var);
        // SAFETY: serialized by ENV_MUTEX and restored before the guard drops.
        unsafe { std::env::set_var(var, value) };
        let out = f();
        match prior {
            Some(v) => unsafe { std::env::set_var(var, v) },
            None => unsafe { std::env::remove_var(var) },
        }
        out
    }

    #[test]
    fn user_root_is_under_local_programs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = with_env("LOCALAPPDATA", tmp.path(), || {
            default_install_root(RegistryScope::User, "HelloApp").unwrap()
        });
        assert_eq!(root, tmp.path().join("Programs").join("HelloApp"));
    }

    #[test]
    fn machine_root_is_under_program_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = with_env("ProgramFiles", tmp.path(), || {
            default_install_root(RegistryScope::Machine, "HelloApp").unwrap()
        });
        assert_eq!(root, tmp.path().join("HelloApp"));
    }

    #[test]
    fn user_start_menu_is_under_appdata() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = with_env("APPDATA", tmp.path(), || start_menu_dir(RegistryScope::User).unwrap());
        assert!(dir.starts_with(tmp.path()));
        assert!(dir.ends_with(Path::new("Start Menu").join("Programs")));
    }

    #[test]
    fn empty_dir_name_is_rejected() {
        assert!(default_install_root(RegistryScope::User, " ").is_err());
    }

    #[test]
    fn data_dir_prefers_env() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = with_env("HEARTH_DATA_DIR", tmp.path(), || data_dir().unwrap());
        assert_eq!(dir, tmp.path());
    }
}
