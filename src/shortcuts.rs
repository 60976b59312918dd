use anyhow::{bail, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use crate::manifest::TaskSelection;
use crate::paths::Layout;
use crate::system::SystemOps;

pub fn shortcut_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    let clean = clean.trim();
    if clean.is_empty() {
        bail!("shortcut name is empty");
    }
    Ok(dir.join(format!("{clean}.lnk")))
}

/// Start menu entry always, desktop entry only when the task was selected.
pub fn planned(layout: &Layout, name: &str, tasks: TaskSelection) -> Result<Vec<PathBuf>> {
    let mut out = vec![shortcut_path(&layout.start_menu, name)?];
    if tasks.desktop_icon {
        out.push(shortcut_path(&layout.desktop, name)?);
    }
    Ok(out)
}

/// Creates the planned shortcuts and removes previously created ones that are no longer wanted
/// (e.g. the desktop icon after the task was unticked on an upgrade).
pub fn apply(
    system: &impl SystemOps,
    layout: &Layout,
    name: &str,
    exe: &Path,
    tasks: TaskSelection,
    previous: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let wanted = planned(layout, name, tasks)?;
    for lnk in previous.iter().filter(|p| !wanted.contains(p)) {
        system.remove_shortcut(lnk)?;
        info!("Removed shortcut {:?}", lnk);
    }
    for lnk in &wanted {
        if previous.contains(lnk) && system.shortcut_exists(lnk) {
            debug!("Shortcut {:?} already present", lnk);
            continue;
        }
        system.create_shortcut(lnk, exe, &layout.root)?;
        info!("Created shortcut {:?}", lnk);
    }
    Ok(wanted)
}

pub fn remove_all(system: &impl SystemOps, shortcuts: &[PathBuf]) -> Result<()> {
    for lnk in shortcuts {
        system.remove_shortcut(lnk)?;
        info!("Removed shortcut {:?}", lnk);
    }
    Ok(())
}
