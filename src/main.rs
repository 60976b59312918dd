//! # Hearth: The Main Entry Point
//!
//! CLI parsing, logging initialization, elevation and dispatch. Hearth installs a frozen
//! desktop application (an executable plus its runtime payload directory) described by a
//! JSON manifest: files, file associations, shortcuts, upgrades in place and uninstall.
//!
//! Exit codes: `0` success, `1` failure, `2` cancelled (closing the running app declined).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use simplelog::{CombinedLogger, Config, SharedLogger, SimpleLogger, WriteLogger};

mod associations;
mod elevation;
mod error;
mod fs_ops;
mod installer;
mod instances;
mod invariants;
mod manifest;
mod paths;
mod payload;
mod pending;
mod record;
mod shortcuts;
mod system;

use installer::{InstallOptions, StatusReport};
use instances::ClosePolicy;
use manifest::Manifest;
use paths::Layout;
use system::{RegistryScope, SystemOps, WindowsSystem};

const LOG_FILE_NAME: &str = "hearth.log";

#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Installs, upgrades and removes a frozen Windows desktop application", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// How to treat a running copy of the application.
#[derive(clap::Args, Clone, Copy)]
struct CloseArgs {
    /// Close running instances without asking.
    #[arg(long, conflicts_with = "no_close")]
    yes: bool,
    /// Never close running instances; abort instead.
    #[arg(long)]
    no_close: bool,
}

impl CloseArgs {
    fn policy(self) -> ClosePolicy {
        match (self.yes, self.no_close) {
            (true, _) => ClosePolicy::Always,
            (_, true) => ClosePolicy::Never,
            _ => ClosePolicy::Ask,
        }
    }
}

/// Where an existing install lives: an explicit directory or the manifest's default.
#[derive(clap::Args)]
struct TargetArgs {
    /// Manifest of the installed application.
    #[arg(conflicts_with = "dir")]
    manifest: Option<PathBuf>,
    /// Install directory.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, upgrade or repair the application described by a manifest.
    ///
    /// Running it again with the same version changes nothing.
    Install {
        manifest: PathBuf,
        /// Install directory. Defaults to Program Files (elevated) or the per-user Programs folder.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Create a desktop shortcut.
        #[arg(long, conflicts_with = "no_desktop_icon")]
        desktop_icon: bool,
        /// Skip the desktop shortcut even if the manifest selects it by default.
        #[arg(long)]
        no_desktop_icon: bool,
        /// Launch the application when done.
        #[arg(long)]
        launch: bool,
        /// Relaunch instances that had to be closed.
        #[arg(long)]
        restart_closed: bool,
        #[command(flatten)]
        close: CloseArgs,
        /// Print what would happen without touching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove everything an install created. Files the installer did not create stay.
    Uninstall {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        close: CloseArgs,
    },
    /// Show what is installed and whether it is intact.
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Stage a new executable to be applied once the application is closed.
    Stage {
        manifest: PathBuf,
        new_exe: PathBuf,
        #[arg(long)]
        version: String,
        /// Install directory, if not the default one.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Apply a staged executable.
    ApplyPending {
        #[command(flatten)]
        close: CloseArgs,
        /// Do not start the application afterwards.
        #[arg(long)]
        no_relaunch: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![SimpleLogger::new(level, Config::default())];
    let log_file = paths::data_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE_NAME)).ok()
    });
    if let Some(file) = log_file {
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    // A broken logger is not a reason to fail an install.
    let _ = CombinedLogger::init(loggers);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        return;
    };

    let system = WindowsSystem;
    if let Err(e) = run(command, &system) {
        error!("{:#}", e);
        std::process::exit(error::exit_code_for(&e));
    }
}

/// The user's explicit desktop icon answer, if any.
fn desktop_choice(desktop_icon: bool, no_desktop_icon: bool) -> Option<bool> {
    match (desktop_icon, no_desktop_icon) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// `true` if an elevated copy of this process took over.
fn elevate_if_needed(needed: bool, system: &impl SystemOps) -> bool {
    if !needed || system.is_elevated() {
        return false;
    }
    warn!("Administrator rights are required. Attempting to elevate...");
    if elevation::relaunch_as_admin() {
        return true;
    }
    error!("Elevation failed or was declined.");
    false
}

fn run(command: Commands, system: &impl SystemOps) -> Result<()> {
    match command {
        Commands::Install { manifest, dir, desktop_icon, no_desktop_icon, launch, restart_closed, close, dry_run } => {
            let manifest = Manifest::load(&manifest)?;
            if !dry_run && elevate_if_needed(manifest.require_admin, system) {
                return Ok(());
            }
            let options = InstallOptions {
                tasks: manifest.tasks.with_choice(desktop_choice(desktop_icon, no_desktop_icon)),
                close_policy: close.policy(),
                restart_closed,
                launch,
            };
            let scope = if dry_run {
                elevation::resolve_scope(system)
            } else {
                installer::check_privileges(&manifest, system)?
            };
            let layout = Layout::resolve(scope, manifest.dir_name(), dir.as_deref())?;
            if dry_run {
                print_plan(&manifest.identity, &installer::plan(&manifest, &layout, scope, &options, system)?);
                return Ok(());
            }
            let outcome = installer::install(&manifest, &layout, scope, &options, system)?;
            println!(
                "{} {} installed to {} ({}): {} copied, {} unchanged, {} removed",
                manifest.identity.name,
                manifest.identity.version,
                outcome.root.display(),
                outcome.relation,
                outcome.copied,
                outcome.skipped,
                outcome.removed
            );
            if outcome.closed > 0 {
                println!("Closed {} running instance(s){}", outcome.closed, if outcome.launched { ", relaunched" } else { "" });
            }
        }
        Commands::Uninstall { target, close } => {
            let root = locate_root(&target, system)?;
            let machine = record::read_record(&root)?.is_some_and(|r| r.scope == RegistryScope::Machine);
            if elevate_if_needed(machine, system) {
                return Ok(());
            }
            let removed = installer::uninstall(&root, close.policy(), system)?;
            println!("{} {} uninstalled from {}", removed.name, removed.version, root.display());
        }
        Commands::Status { target } => {
            let root = locate_root(&target, system)?;
            print_status(&root, &installer::status(&root, system)?);
        }
        Commands::Stage { manifest, new_exe, version, dir } => {
            let target = TargetArgs { manifest: Some(manifest), dir };
            let root = locate_root(&target, system)?;
            let rec = record::read_record(&root)?
                .ok_or_else(|| error::InstallError::NotInstalled(root.display().to_string()))?;
            let staged = pending::stage(&paths::data_dir()?, &root.join(&rec.executable), &new_exe, &version)?;
            println!("Staged {} for {}", staged.new_version, staged.current_exe.display());
        }
        Commands::ApplyPending { close, no_relaunch } => {
            match pending::apply(&paths::data_dir()?, system, close.policy(), !no_relaunch)? {
                pending::ApplyOutcome::NothingPending => println!("No pending update"),
                pending::ApplyOutcome::Applied { version, relaunched } => {
                    println!("Updated to {version}{}", if relaunched { ", relaunched" } else { "" });
                }
            }
        }
    }
    Ok(())
}

/// Finds the install root. With a manifest, the default root of the current scope wins if it
/// holds an install, then the other scope's.
fn locate_root(target: &TargetArgs, system: &impl SystemOps) -> Result<PathBuf> {
    if let Some(dir) = &target.dir {
        return Ok(dir.clone());
    }
    let Some(manifest_path) = &target.manifest else {
        bail!("pass a manifest or --dir");
    };
    let manifest = Manifest::load(manifest_path)?;
    let preferred = elevation::resolve_scope(system);
    let other = match preferred {
        RegistryScope::Machine => RegistryScope::User,
        RegistryScope::User => RegistryScope::Machine,
    };
    let first = paths::default_install_root(preferred, manifest.dir_name())?;
    if record::record_path(&first).exists() {
        return Ok(first);
    }
    if let Ok(second) = paths::default_install_root(other, manifest.dir_name()) {
        if record::record_path(&second).exists() {
            info!("Found the install under the {} scope", other);
            return Ok(second);
        }
    }
    Ok(first)
}

fn print_plan(identity: &manifest::AppIdentity, plan: &installer::InstallPlan) {
    println!("Dry run: {} into {} ({} scope)", plan.relation, plan.root.display(), plan.scope);
    println!("{} {} by {} ({})", identity.name, identity.version, identity.publisher, identity.url);
    println!("Installer name: {}", plan.installer_name);
    if plan.running > 0 {
        println!("{} running instance(s) would have to be closed", plan.running);
    }
    println!("Files to copy ({}):", plan.copy.len());
    for f in &plan.copy {
        println!("  {f}");
    }
    println!("Unchanged files: {}", plan.skip.len());
    println!("Registry values under {}:", plan.scope);
    for e in &plan.registry {
        let name = if e.name.is_empty() { "(default)" } else { e.name.as_str() };
        println!("  {}\\{} = {:?}", e.key, name, e.value);
    }
    for ext in &plan.already_registered {
        println!("  {ext} is already registered with these values");
    }
    println!("Shortcuts:");
    for s in &plan.shortcuts {
        println!("  {}", s.display());
    }
}

fn print_status(root: &Path, report: &StatusReport) {
    let rec = &report.record;
    println!("{} {} ({})", rec.name, rec.version, rec.app_id);
    println!("  Location: {} ({} scope)", root.display(), rec.scope);
    println!("  Files: {} recorded, {} missing", rec.files.len(), report.missing_files.len());
    for f in &report.missing_files {
        println!("    missing: {f}");
    }
    for a in &report.associations {
        let state = if a.registered { "registered" } else { "NOT registered" };
        println!("  {} -> {}: {}", a.association.extension, a.association.prog_id, state);
    }
    println!("  Shortcuts: {}", rec.shortcuts.len());
    println!("  Running instances: {}", report.running);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::TaskSelection;

    fn install_tasks(args: &[&str], default_desktop: bool) -> TaskSelection {
        let cli = Cli::try_parse_from(args).unwrap();
        let Some(Commands::Install { desktop_icon, no_desktop_icon, .. }) = cli.command else {
            panic!("not an install command");
        };
        TaskSelection { desktop_icon: default_desktop }.with_choice(desktop_choice(desktop_icon, no_desktop_icon))
    }

    #[test]
    fn no_desktop_icon_declines_manifest_default() {
        let tasks = install_tasks(&["hearth", "install", "hello.json", "--no-desktop-icon"], true);
        assert!(!tasks.desktop_icon);
    }

    #[test]
    fn manifest_default_applies_without_flags() {
        assert!(install_tasks(&["hearth", "install", "hello.json"], true).desktop_icon);
        assert!(!install_tasks(&["hearth", "install", "hello.json"], false).desktop_icon);
        assert!(install_tasks(&["hearth", "install", "hello.json", "--desktop-icon"], false).desktop_icon);
    }

    #[test]
    fn desktop_flags_conflict() {
        let res = Cli::try_parse_from(["hearth", "install", "hello.json", "--desktop-icon", "--no-desktop-icon"]);
        assert!(res.is_err());
    }

    #[test]
    fn close_flags_pick_policy() {
        let cli = Cli::try_parse_from(["hearth", "uninstall", "--dir", "C:/Apps/HelloApp", "--yes"]).unwrap();
        let Some(Commands::Uninstall { close, .. }) = cli.command else {
            panic!("not an uninstall command");
        };
        assert_eq!(close.policy(), ClosePolicy::Always);
    }
}
