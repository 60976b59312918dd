//! # Installer Logic
//!
//! The orchestrator. One install (or upgrade, or repair) is a fixed sequence:
//!
//! 1. Read the install record and make sure the root holds the same product.
//! 2. Close running instances of the target executable. Declined or failed means stop,
//!    before the install root is even created.
//! 3. Copy the executable and payload, skipping unchanged files, and drop files the new
//!    version no longer ships.
//! 4. Register file associations, unregistering the ones the new version dropped.
//! 5. Create shortcuts (start menu always, desktop if selected).
//! 6. Write the record, notify the shell, relaunch what was closed or launch on finish.
//!
//! Running the same install twice changes nothing the second time.

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{info, warn};
use crate::associations::{self, RegisteredAssociation, RegistryEntry};
use crate::elevation::resolve_scope;
use crate::error::InstallError;
use crate::fs_ops;
use crate::instances::{self, ClosePolicy};
use crate::invariants::{assert_invariant, RECORD_MATCHES_REGISTRY, STABLE_PRODUCT_ID};
use crate::manifest::{parse_version, InstallTarget, Manifest, TaskSelection};
use crate::paths::Layout;
use crate::payload;
use crate::record::{self, InstallRecord};
use crate::shortcuts;
use crate::system::{RegistryScope, SystemOps};

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub tasks: TaskSelection,
    pub close_policy: ClosePolicy,
    /// Relaunch instances that were closed for the upgrade.
    pub restart_closed: bool,
    /// Launch the application once installation finished.
    pub launch: bool,
}

/// How the incoming version relates to what is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    Fresh,
    Same,
    Newer,
    Older,
    Unknown,
}

impl std::fmt::Display for VersionRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VersionRelation::Fresh => "fresh install",
            VersionRelation::Same => "reinstall of the same version",
            VersionRelation::Newer => "upgrade",
            VersionRelation::Older => "downgrade",
            VersionRelation::Unknown => "replacement (versions not comparable)",
        };
        f.write_str(s)
    }
}

pub fn compare_versions(installed: &str, incoming: &str) -> VersionRelation {
    if installed.trim() == incoming.trim() {
        return VersionRelation::Same;
    }
    match (parse_version(installed), parse_version(incoming)) {
        (Some(installed), Some(incoming)) => match incoming.cmp(&installed) {
            std::cmp::Ordering::Greater => VersionRelation::Newer,
            std::cmp::Ordering::Less => VersionRelation::Older,
            std::cmp::Ordering::Equal => VersionRelation::Same,
        },
        _ => VersionRelation::Unknown,
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub root: PathBuf,
    pub relation: VersionRelation,
    pub copied: usize,
    pub skipped: usize,
    pub removed: usize,
    pub closed: usize,
    pub launched: bool,
}

/// Resolves the registry scope and enforces `require_admin`.
pub fn check_privileges(manifest: &Manifest, system: &impl SystemOps) -> Result<RegistryScope> {
    let scope = resolve_scope(system);
    if manifest.require_admin && scope != RegistryScope::Machine {
        return Err(InstallError::InsufficientPrivileges.into());
    }
    Ok(scope)
}

/// Loads the existing record and refuses roots that belong to another product.
fn existing_record(root: &Path, manifest: &Manifest) -> Result<(Option<InstallRecord>, VersionRelation)> {
    let existing = record::read_record(root)?;
    let Some(rec) = existing else {
        return Ok((None, VersionRelation::Fresh));
    };
    let same_product = rec.app_id == manifest.identity.id;
    if !same_product {
        return Err(InstallError::ForeignProduct {
            expected: manifest.identity.id.clone(),
            found: rec.app_id.clone(),
        }
        .into());
    }
    assert_invariant(same_product, STABLE_PRODUCT_ID, Some("Installer"));
    let relation = compare_versions(&rec.version, &manifest.identity.version);
    Ok((Some(rec), relation))
}

pub fn install(
    manifest: &Manifest,
    layout: &Layout,
    scope: RegistryScope,
    options: &InstallOptions,
    system: &impl SystemOps,
) -> Result<InstallOutcome> {
    let root = &layout.root;
    let identity = &manifest.identity;
    let (previous, relation) = existing_record(root, manifest)?;
    info!("{} {} into {:?}: {}", identity.name, identity.version, root, relation);
    if relation == VersionRelation::Older {
        if let Some(prev) = &previous {
            warn!("Installed version {} is newer than {}, downgrading", prev.version, identity.version);
        }
    }

    // Validate the build output before anything is closed or written.
    let sources = payload::collect_sources(manifest)?;
    let target = InstallTarget::new(root, manifest);

    let closed = instances::ensure_not_running(system, &target.executable, options.close_policy)?;

    std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let previous_files = previous.as_ref().map(|p| p.files.as_slice()).unwrap_or(&[]);
    let planned = payload::plan(sources, root, previous_files);
    let report = payload::copy_planned(&planned, root)?;
    let removed = payload::remove_stale(root, previous_files, &report.files)?;

    let registered = associations::register(system, scope, &manifest.associations, &target)?;
    let mut associations_changed = !registered.is_empty();
    if let Some(prev) = &previous {
        let stale: Vec<RegisteredAssociation> = prev
            .associations
            .iter()
            .filter(|old| prev.scope != scope || !registered.contains(old))
            .cloned()
            .collect();
        if !stale.is_empty() {
            associations::unregister_stale(system, prev.scope, &stale, scope, &registered)?;
            associations_changed = true;
        }
    }

    let previous_shortcuts = previous.as_ref().map(|p| p.shortcuts.as_slice()).unwrap_or(&[]);
    let created_shortcuts = shortcuts::apply(
        system,
        layout,
        &identity.name,
        &target.executable,
        options.tasks,
        previous_shortcuts,
    )?;

    let mut new_record = InstallRecord {
        app_id: identity.id.clone(),
        name: identity.name.clone(),
        version: identity.version.clone(),
        scope,
        executable: manifest.executable.clone(),
        payload_dir: manifest.payload_dir.clone(),
        files: report.files.clone(),
        associations: registered,
        shortcuts: created_shortcuts,
        installed_at: record::now_unix(),
    };
    assert_invariant(
        new_record.associations.len() == manifest.associations.len(),
        RECORD_MATCHES_REGISTRY,
        Some("Installer"),
    );
    if let Some(prev) = previous.as_ref().filter(|_| relation == VersionRelation::Same) {
        new_record.installed_at = prev.installed_at;
    }
    if previous.as_ref() == Some(&new_record) {
        info!("Install record unchanged");
    } else {
        record::write_record(root, &new_record)?;
    }

    if associations_changed {
        system.notify_associations_changed();
    }

    let mut launched = false;
    if options.restart_closed && closed.any() {
        info!("Restarting {} closed for the upgrade", identity.name);
        system.launch(&closed.exe)?;
        launched = true;
    }
    if options.launch && !launched {
        system.launch(&target.executable)?;
        launched = true;
    }

    info!("{} {} installed successfully", identity.name, identity.version);
    Ok(InstallOutcome {
        root: root.clone(),
        relation,
        copied: report.copied.len(),
        skipped: report.skipped.len(),
        removed: removed.len(),
        closed: closed.count,
        launched,
    })
}

/// Removes everything the record lists. User files in the root survive.
pub fn uninstall(root: &Path, close_policy: ClosePolicy, system: &impl SystemOps) -> Result<InstallRecord> {
    let rec = record::read_record(root)?
        .ok_or_else(|| InstallError::NotInstalled(root.display().to_string()))?;
    if rec.scope == RegistryScope::Machine && !system.is_elevated() {
        return Err(InstallError::InsufficientPrivileges.into());
    }
    info!("Uninstalling {} {} from {:?}", rec.name, rec.version, root);

    instances::ensure_not_running(system, &root.join(&rec.executable), close_policy)?;

    for assoc in &rec.associations {
        associations::unregister(system, rec.scope, assoc)?;
    }
    if !rec.associations.is_empty() {
        system.notify_associations_changed();
    }
    shortcuts::remove_all(system, &rec.shortcuts)?;
    payload::remove_installed(root, &rec.files)?;
    fs_ops::remove_file_forced(&record::record_path(root))?;
    fs_ops::prune_empty_dirs(root, root);
    if root.exists() {
        info!("Kept {:?}: it still holds files the installer did not create", root);
    }
    info!("{} uninstalled", rec.name);
    Ok(rec)
}

#[derive(Debug, Clone)]
pub struct AssociationStatus {
    pub association: RegisteredAssociation,
    pub registered: bool,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub record: InstallRecord,
    pub running: usize,
    pub associations: Vec<AssociationStatus>,
    pub missing_files: Vec<String>,
}

/// Read-only view of an install.
pub fn status(root: &Path, system: &impl SystemOps) -> Result<StatusReport> {
    let rec = record::read_record(root)?
        .ok_or_else(|| InstallError::NotInstalled(root.display().to_string()))?;
    let running = system.running_instances(&root.join(&rec.executable))?.len();
    let mut assocs = Vec::new();
    for assoc in &rec.associations {
        let key = format!(r"{}\{}\OpenWithProgids", associations::CLASSES, assoc.extension);
        let registered = system.read_registry_string(rec.scope, &key, &assoc.prog_id)?.is_some();
        assocs.push(AssociationStatus { association: assoc.clone(), registered });
    }
    let missing_files = rec
        .files
        .iter()
        .filter(|f| !f.absolute(root).is_file())
        .map(|f| f.path.clone())
        .collect();
    Ok(StatusReport { record: rec, running, associations: assocs, missing_files })
}

/// What [`install`] would do, computed without side effects.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub root: PathBuf,
    pub scope: RegistryScope,
    pub relation: VersionRelation,
    pub installer_name: String,
    pub copy: Vec<String>,
    pub skip: Vec<String>,
    pub registry: Vec<RegistryEntry>,
    /// Extensions whose registry entries already hold the planned values.
    pub already_registered: Vec<String>,
    pub shortcuts: Vec<PathBuf>,
    pub running: usize,
}

pub fn plan(
    manifest: &Manifest,
    layout: &Layout,
    scope: RegistryScope,
    options: &InstallOptions,
    system: &impl SystemOps,
) -> Result<InstallPlan> {
    let root = &layout.root;
    let (previous, relation) = existing_record(root, manifest)?;
    let target = InstallTarget::new(root, manifest);
    let previous_files = previous.as_ref().map(|p| p.files.as_slice()).unwrap_or(&[]);
    let planned = payload::plan(payload::collect_sources(manifest)?, root, previous_files);
    let (skip, copy): (Vec<_>, Vec<_>) = planned.into_iter().partition(|p| p.skip);
    let registry = manifest
        .associations
        .iter()
        .flat_map(|a| associations::entries_for(a, &target))
        .collect();
    let mut already_registered = Vec::new();
    for assoc in &manifest.associations {
        if associations::is_registered(system, scope, assoc, &target)? {
            already_registered.push(assoc.extension.clone());
        }
    }
    Ok(InstallPlan {
        root: root.clone(),
        scope,
        relation,
        installer_name: manifest.identity.installer_file_name(),
        copy: copy.into_iter().map(|p| p.file.entry.path).collect(),
        skip: skip.into_iter().map(|p| p.file.entry.path).collect(),
        registry,
        already_registered,
        shortcuts: shortcuts::planned(layout, &manifest.identity.name, options.tasks)?,
        running: system.running_instances(&target.executable)?.len(),
    })
}
