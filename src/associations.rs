//! # File Associations
//!
//! Writes and removes the registry layout that makes Explorer offer the installed
//! executable for an extension. Everything lives under `Software\Classes` of the resolved
//! hive, which Windows merges into `HKEY_CLASSES_ROOT`:
//!
//! ```text
//! Classes\<ext>\OpenWithProgids         <prog_id> = ""
//! Classes\<prog_id>                     (default) = <display name>
//! Classes\<prog_id>\DefaultIcon         (default) = <install-path>\<exe>,0
//! Classes\<prog_id>\shell\open\command  (default) = "<install-path>\<exe>" "%1"
//! ```
//!
//! The extension key itself is shared with other applications, so uninstall only removes
//! our value under `OpenWithProgids` and prunes the keys that end up empty.

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use crate::error::InstallError;
use crate::manifest::{FileAssociation, InstallTarget};
use crate::system::{RegistryScope, SystemOps};

pub const CLASSES: &str = r"Software\Classes";

/// The identifiers needed to undo one association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredAssociation {
    pub extension: String,
    pub prog_id: String,
}

impl From<&FileAssociation> for RegisteredAssociation {
    fn from(a: &FileAssociation) -> Self {
        Self {
            extension: a.extension.clone(),
            prog_id: a.prog_id.clone(),
        }
    }
}

/// One string value to write. An empty `name` is the key's default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub key: String,
    pub name: String,
    pub value: String,
}

fn open_with_key(extension: &str) -> String {
    format!(r"{CLASSES}\{extension}\OpenWithProgids")
}

fn extension_key(extension: &str) -> String {
    format!(r"{CLASSES}\{extension}")
}

fn prog_id_key(prog_id: &str) -> String {
    format!(r"{CLASSES}\{prog_id}")
}

/// The exact values one association consists of.
pub fn entries_for(assoc: &FileAssociation, target: &InstallTarget) -> Vec<RegistryEntry> {
    let prog = prog_id_key(&assoc.prog_id);
    vec![
        RegistryEntry {
            key: open_with_key(&assoc.extension),
            name: assoc.prog_id.clone(),
            value: String::new(),
        },
        RegistryEntry {
            key: prog.clone(),
            name: String::new(),
            value: assoc.display_name.clone(),
        },
        RegistryEntry {
            key: format!(r"{prog}\DefaultIcon"),
            name: String::new(),
            value: assoc.icon_value(target),
        },
        RegistryEntry {
            key: format!(r"{prog}\shell\open\command"),
            name: String::new(),
            value: assoc.command_value(target),
        },
    ]
}

/// Registers every association. Values that already hold the right data are not rewritten.
///
/// The first failing write aborts with [`InstallError::RegistryWrite`]. Earlier writes stay.
pub fn register(
    system: &impl SystemOps,
    scope: RegistryScope,
    associations: &[FileAssociation],
    target: &InstallTarget,
) -> Result<Vec<RegisteredAssociation>> {
    let mut registered = Vec::new();
    for assoc in associations {
        for entry in entries_for(assoc, target) {
            let current = system.read_registry_string(scope, &entry.key, &entry.name)?;
            if current.as_deref() == Some(entry.value.as_str()) {
                debug!("{}\\{} [{}] already set", scope, entry.key, entry.name);
                continue;
            }
            system
                .set_registry_string(scope, &entry.key, &entry.name, &entry.value)
                .map_err(|source| InstallError::RegistryWrite {
                    key: format!(r"{}\{}", scope, entry.key),
                    source: source.into(),
                })?;
        }
        info!("Registered {} -> {} ({})", assoc.extension, assoc.prog_id, scope);
        registered.push(RegisteredAssociation::from(assoc));
    }
    Ok(registered)
}

/// Removes our value from the extension's `OpenWithProgids` and prunes the keys left empty.
/// The progid key is left alone.
pub fn unregister_extension(system: &impl SystemOps, scope: RegistryScope, assoc: &RegisteredAssociation) -> Result<()> {
    let open_with = open_with_key(&assoc.extension);
    system.delete_registry_value(scope, &open_with, &assoc.prog_id)?;
    if system.registry_key_is_empty(scope, &open_with)? {
        system.delete_registry_tree(scope, &open_with)?;
    }
    let ext = extension_key(&assoc.extension);
    if system.registry_key_is_empty(scope, &ext)? {
        system.delete_registry_tree(scope, &ext)?;
    }
    debug!("Removed {} from {} ({})", assoc.prog_id, assoc.extension, scope);
    Ok(())
}

pub fn remove_prog_id(system: &impl SystemOps, scope: RegistryScope, prog_id: &str) -> Result<()> {
    system.delete_registry_tree(scope, &prog_id_key(prog_id))
}

/// Removes what [`register`] created for one association.
pub fn unregister(system: &impl SystemOps, scope: RegistryScope, assoc: &RegisteredAssociation) -> Result<()> {
    unregister_extension(system, scope, assoc)?;
    remove_prog_id(system, scope, &assoc.prog_id)?;
    info!("Unregistered {} -> {} ({})", assoc.extension, assoc.prog_id, scope);
    Ok(())
}

/// Unregisters `stale` associations from `scope`. A progid still named by one of `kept`
/// (registered in `kept_scope`) keeps its key.
pub fn unregister_stale(
    system: &impl SystemOps,
    scope: RegistryScope,
    stale: &[RegisteredAssociation],
    kept_scope: RegistryScope,
    kept: &[RegisteredAssociation],
) -> Result<()> {
    for old in stale {
        unregister_extension(system, scope, old)?;
        let still_used = scope == kept_scope && kept.iter().any(|k| k.prog_id.eq_ignore_ascii_case(&old.prog_id));
        if still_used {
            debug!("{} is still used, keeping its key", old.prog_id);
        } else {
            remove_prog_id(system, scope, &old.prog_id)?;
        }
        info!("Unregistered {} -> {} ({})", old.extension, old.prog_id, scope);
    }
    Ok(())
}

/// Whether every value of the association is present with the expected data.
pub fn is_registered(
    system: &impl SystemOps,
    scope: RegistryScope,
    assoc: &FileAssociation,
    target: &InstallTarget,
) -> Result<bool> {
    for entry in entries_for(assoc, target) {
        if system.read_registry_string(scope, &entry.key, &entry.name)?.as_deref() != Some(entry.value.as_str()) {
            return Ok(false);
        }
    }
    Ok(true)
}
