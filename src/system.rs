#[cfg(test)]
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, Write};
use std::path::Path;
#[cfg(test)]
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Registry hive an install writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistryScope {
    /// `HKEY_LOCAL_MACHINE`, all users. Needs elevation.
    Machine,
    /// `HKEY_CURRENT_USER`.
    User,
}

impl std::fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryScope::Machine => write!(f, "HKLM"),
            RegistryScope::User => write!(f, "HKCU"),
        }
    }
}

/// Abstraction for every machine side effect the installer has (Registry, processes, Shell).
/// This lets the orchestration run against a mock in tests.
pub trait SystemOps {
    /// Whether the current process token is elevated.
    fn is_elevated(&self) -> bool;

    /// Create `key` (and its parents) and set a string value. An empty `name` is the default value.
    fn set_registry_string(&self, scope: RegistryScope, key: &str, name: &str, value: &str) -> Result<()>;

    /// Read a string value. `Ok(None)` if the key or value does not exist.
    fn read_registry_string(&self, scope: RegistryScope, key: &str, name: &str) -> Result<Option<String>>;

    /// Delete one value. Missing keys or values are not an error.
    fn delete_registry_value(&self, scope: RegistryScope, key: &str, name: &str) -> Result<()>;

    /// Delete a key with all its subkeys. A missing key is not an error.
    fn delete_registry_tree(&self, scope: RegistryScope, key: &str) -> Result<()>;

    /// `true` if the key has neither subkeys nor values (or does not exist).
    fn registry_key_is_empty(&self, scope: RegistryScope, key: &str) -> Result<bool>;

    /// Tell Explorer that file associations changed.
    fn notify_associations_changed(&self);

    /// PIDs of processes running from exactly this executable path.
    fn running_instances(&self, exe: &Path) -> Result<Vec<u32>>;

    /// Forcefully terminate a process.
    fn terminate_process(&self, pid: u32) -> Result<()>;

    /// Ask the user a yes/no question.
    fn confirm(&self, question: &str) -> bool;

    /// Create (or overwrite) a `.lnk` shortcut.
    fn create_shortcut(&self, lnk: &Path, target: &Path, working_dir: &Path) -> Result<()>;

    /// Remove a `.lnk` shortcut. Missing files are not an error.
    fn remove_shortcut(&self, lnk: &Path) -> Result<()>;

    fn shortcut_exists(&self, lnk: &Path) -> bool;

    /// Start a detached process.
    fn launch(&self, exe: &Path) -> Result<()>;

    fn sleep(&self, duration: Duration);
}

/// The Real System implementation (Production).
pub struct WindowsSystem;

#[cfg(windows)]
fn hive(scope: RegistryScope) -> &'static windows_registry::Key {
    match scope {
        RegistryScope::Machine => windows_registry::LOCAL_MACHINE,
        RegistryScope::User => windows_registry::CURRENT_USER,
    }
}

impl SystemOps for WindowsSystem {
    fn is_elevated(&self) -> bool {
        crate::elevation::is_elevated()
    }

    #[cfg(windows)]
    fn set_registry_string(&self, scope: RegistryScope, key: &str, name: &str, value: &str) -> Result<()> {
        let k = hive(scope).create(key)?;
        k.set_string(name, value)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_registry_string(&self, scope: RegistryScope, key: &str, name: &str) -> Result<Option<String>> {
        let Ok(k) = hive(scope).open(key) else {
            return Ok(None);
        };
        Ok(k.get_string(name).ok())
    }

    #[cfg(windows)]
    fn delete_registry_value(&self, scope: RegistryScope, key: &str, name: &str) -> Result<()> {
        if hive(scope).open(key).is_err() {
            return Ok(());
        }
        let k = hive(scope).create(key)?;
        let present = k.values()?.any(|(n, _)| n.eq_ignore_ascii_case(name));
        if present {
            k.remove_value(name)?;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn delete_registry_tree(&self, scope: RegistryScope, key: &str) -> Result<()> {
        if hive(scope).open(key).is_err() {
            return Ok(());
        }
        hive(scope).remove_tree(key)?;
        Ok(())
    }

    #[cfg(windows)]
    fn registry_key_is_empty(&self, scope: RegistryScope, key: &str) -> Result<bool> {
        let Ok(k) = hive(scope).open(key) else {
            return Ok(true);
        };
        Ok(k.keys()?.next().is_none() && k.values()?.next().is_none())
    }

    #[cfg(windows)]
    fn notify_associations_changed(&self) {
        use windows::Win32::UI::Shell::{SHChangeNotify, SHCNE_ASSOCCHANGED, SHCNF_IDLIST};
        unsafe {
            SHChangeNotify(SHCNE_ASSOCCHANGED, SHCNF_IDLIST, None, None);
        }
    }

    #[cfg(not(windows))]
    fn set_registry_string(&self, _: RegistryScope, key: &str, _: &str, _: &str) -> Result<()> {
        bail!("registry is only available on Windows (key {key})")
    }

    #[cfg(not(windows))]
    fn read_registry_string(&self, _: RegistryScope, _: &str, _: &str) -> Result<Option<String>> {
        Ok(None)
    }

    #[cfg(not(windows))]
    fn delete_registry_value(&self, _: RegistryScope, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    #[cfg(not(windows))]
    fn delete_registry_tree(&self, _: RegistryScope, _: &str) -> Result<()> {
        Ok(())
    }

    #[cfg(not(windows))]
    fn registry_key_is_empty(&self, _: RegistryScope, _: &str) -> Result<bool> {
        Ok(true)
    }

    #[cfg(not(windows))]
    fn notify_associations_changed(&self) {}

    fn running_instances(&self, exe: &Path) -> Result<Vec<u32>> {
        // Get-Process exposes the full image path, tasklist only the file name.
        let script = format!(
            "Get-Process | Where-Object {{ $_.Path -eq {} }} | ForEach-Object {{ $_.Id }}",
            ps_quote(&exe.display().to_string())
        );
        let output = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-Command")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .context("run powershell Get-Process")?;
        if !output.status.success() {
            bail!("process query failed (exit {:?})", output.status.code());
        }
        let pids = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect();
        Ok(pids)
    }

    fn terminate_process(&self, pid: u32) -> Result<()> {
        let status = Command::new("taskkill")
            .arg("/PID")
            .arg(pid.to_string())
            .arg("/F")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("run taskkill")?;
        if !status.success() {
            bail!("taskkill /PID {pid} failed (exit {:?})", status.code());
        }
        Ok(())
    }

    fn confirm(&self, question: &str) -> bool {
        print!("{question} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    fn create_shortcut(&self, lnk: &Path, target: &Path, working_dir: &Path) -> Result<()> {
        if let Some(parent) = lnk.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let script = format!(
            "$WshShell = New-Object -ComObject WScript.Shell; \
             $Shortcut = $WshShell.CreateShortcut({lnk}); \
             $Shortcut.TargetPath = {tgt}; \
             $Shortcut.WorkingDirectory = {wd}; \
             $Shortcut.IconLocation = {icon}; \
             $Shortcut.Save();",
            lnk = ps_quote(&lnk.display().to_string()),
            tgt = ps_quote(&target.display().to_string()),
            wd = ps_quote(&working_dir.display().to_string()),
            icon = ps_quote(&format!("{},0", target.display())),
        );
        let status = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-Command")
            .arg(script)
            .stdin(Stdio::null())
            .status()
            .context("run powershell")?;
        if !status.success() {
            bail!("failed to create shortcut {} (exit {:?})", lnk.display(), status.code());
        }
        Ok(())
    }

    fn remove_shortcut(&self, lnk: &Path) -> Result<()> {
        if lnk.exists() {
            std::fs::remove_file(lnk).with_context(|| format!("remove {}", lnk.display()))?;
        }
        Ok(())
    }

    fn shortcut_exists(&self, lnk: &Path) -> bool {
        lnk.is_file()
    }

    fn launch(&self, exe: &Path) -> Result<()> {
        let mut cmd = Command::new(exe);
        if let Some(dir) = exe.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd.spawn().with_context(|| format!("launch {}", exe.display()))?;
        debug!("Launched {:?}", exe);
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A Mock System for Testing.
///
/// Registry keys are stored lowercased (the registry is case-insensitive), one map of
/// values per key. Creating a key creates all of its parents, like `RegCreateKeyEx`.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockSystem {
    pub elevated: bool,
    pub registry: std::sync::Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pub registry_writes: std::sync::Mutex<usize>,
    pub fail_registry_writes: bool,
    pub processes: std::sync::Mutex<HashMap<PathBuf, Vec<u32>>>,
    /// Processes that survive `terminate_process`.
    pub unkillable: bool,
    pub confirm_answer: bool,
    pub questions: std::sync::Mutex<Vec<String>>,
    pub shortcuts: std::sync::Mutex<BTreeSet<PathBuf>>,
    pub launched: std::sync::Mutex<Vec<PathBuf>>,
    pub notifications: std::sync::Mutex<usize>,
}

#[cfg(test)]
impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(exe: &Path, pids: &[u32]) -> Self {
        let mock = Self::default();
        mock.processes.lock().unwrap().insert(exe.to_path_buf(), pids.to_vec());
        mock
    }

    fn slot(scope: RegistryScope, key: &str) -> String {
        format!("{}\\{}", scope, key.trim_matches('\\').to_lowercase())
    }

    /// Snapshot of the whole mock registry, for before/after comparisons.
    pub fn registry_snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.registry.lock().unwrap().clone()
    }

    pub fn key_exists(&self, scope: RegistryScope, key: &str) -> bool {
        self.registry.lock().unwrap().contains_key(&Self::slot(scope, key))
    }

    pub fn value_count(&self, scope: RegistryScope, key: &str) -> usize {
        self.registry
            .lock()
            .unwrap()
            .get(&Self::slot(scope, key))
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl SystemOps for MockSystem {
    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn set_registry_string(&self, scope: RegistryScope, key: &str, name: &str, value: &str) -> Result<()> {
        if self.fail_registry_writes {
            bail!("access denied");
        }
        let mut reg = self.registry.lock().unwrap();
        let slot = Self::slot(scope, key);
        let mut parent = slot.as_str();
        while let Some((p, _)) = parent.rsplit_once('\\') {
            reg.entry(p.to_string()).or_default();
            parent = p;
        }
        reg.entry(slot).or_default().insert(name.to_lowercase(), value.to_string());
        *self.registry_writes.lock().unwrap() += 1;
        Ok(())
    }

    fn read_registry_string(&self, scope: RegistryScope, key: &str, name: &str) -> Result<Option<String>> {
        let reg = self.registry.lock().unwrap();
        Ok(reg
            .get(&Self::slot(scope, key))
            .and_then(|values| values.get(&name.to_lowercase()))
            .cloned())
    }

    fn delete_registry_value(&self, scope: RegistryScope, key: &str, name: &str) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        if let Some(values) = reg.get_mut(&Self::slot(scope, key)) {
            values.remove(&name.to_lowercase());
        }
        Ok(())
    }

    fn delete_registry_tree(&self, scope: RegistryScope, key: &str) -> Result<()> {
        let slot = Self::slot(scope, key);
        let prefix = format!("{slot}\\");
        self.registry
            .lock()
            .unwrap()
            .retain(|k, _| *k != slot && !k.starts_with(&prefix));
        Ok(())
    }

    fn registry_key_is_empty(&self, scope: RegistryScope, key: &str) -> Result<bool> {
        let slot = Self::slot(scope, key);
        let prefix = format!("{slot}\\");
        let reg = self.registry.lock().unwrap();
        let has_values = reg.get(&slot).is_some_and(|v| !v.is_empty());
        let has_subkeys = reg.keys().any(|k| k.starts_with(&prefix));
        Ok(!has_values && !has_subkeys)
    }

    fn notify_associations_changed(&self) {
        *self.notifications.lock().unwrap() += 1;
    }

    fn running_instances(&self, exe: &Path) -> Result<Vec<u32>> {
        Ok(self.processes.lock().unwrap().get(exe).cloned().unwrap_or_default())
    }

    fn terminate_process(&self, pid: u32) -> Result<()> {
        if self.unkillable {
            return Ok(());
        }
        for pids in self.processes.lock().unwrap().values_mut() {
            pids.retain(|p| *p != pid);
        }
        Ok(())
    }

    fn confirm(&self, question: &str) -> bool {
        self.questions.lock().unwrap().push(question.to_string());
        self.confirm_answer
    }

    fn create_shortcut(&self, lnk: &Path, _target: &Path, _working_dir: &Path) -> Result<()> {
        self.shortcuts.lock().unwrap().insert(lnk.to_path_buf());
        Ok(())
    }

    fn remove_shortcut(&self, lnk: &Path) -> Result<()> {
        self.shortcuts.lock().unwrap().remove(lnk);
        Ok(())
    }

    fn shortcut_exists(&self, lnk: &Path) -> bool {
        self.shortcuts.lock().unwrap().contains(lnk)
    }

    fn launch(&self, exe: &Path) -> Result<()> {
        self.launched.lock().unwrap().push(exe.to_path_buf());
        Ok(())
    }

    fn sleep(&self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_registry_creates_parent_keys() {
        let mock = MockSystem::new();
        mock.set_registry_string(RegistryScope::User, r"Software\Classes\.hello\OpenWithProgids", "Hello.Doc", "")
            .unwrap();
        assert!(mock.key_exists(RegistryScope::User, r"Software\Classes\.hello"));
        assert!(!mock.registry_key_is_empty(RegistryScope::User, r"Software\Classes\.hello").unwrap());
        assert!(!mock.key_exists(RegistryScope::Machine, r"Software\Classes\.hello"));
    }

    #[test]
    fn mock_registry_is_case_insensitive() {
        let mock = MockSystem::new();
        mock.set_registry_string(RegistryScope::User, r"Software\Classes\Hello.Doc", "", "Hello").unwrap();
        let v = mock.read_registry_string(RegistryScope::User, r"SOFTWARE\classes\hello.doc", "").unwrap();
        assert_eq!(v.as_deref(), Some("Hello"));
    }

    #[test]
    fn mock_tree_delete_removes_subkeys_only_below() {
        let mock = MockSystem::new();
        mock.set_registry_string(RegistryScope::User, r"Software\Classes\Hello.Doc\shell\open\command", "", "x").unwrap();
        mock.set_registry_string(RegistryScope::User, r"Software\Classes\Hello.Doc2", "", "y").unwrap();
        mock.delete_registry_tree(RegistryScope::User, r"Software\Classes\Hello.Doc").unwrap();
        assert!(!mock.key_exists(RegistryScope::User, r"Software\Classes\Hello.Doc\shell"));
        assert!(mock.key_exists(RegistryScope::User, r"Software\Classes\Hello.Doc2"));
    }

    #[test]
    fn ps_quote_escapes_single_quotes() {
        assert_eq!(ps_quote(r"C:\O'Brien\app.exe"), r"'C:\O''Brien\app.exe'");
    }
}
