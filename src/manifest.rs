//! # Manifest Module
//!
//! The declarative description of one installable product: who it is (`AppIdentity`),
//! where its build output lives, which file types it opens (`FileAssociation`) and which
//! optional tasks the user picked (`TaskSelection`).
//!
//! Manifests are JSON files. Relative `source_dir` values resolve against the directory
//! the manifest was loaded from, so a manifest can sit next to the build output.

use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use crate::error::InstallError;

/// Immutable product identity. `id` must never change between versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub url: String,
}

impl AppIdentity {
    /// Version parsed leniently (`1.0` is read as `1.0.0`).
    pub fn parsed_version(&self) -> Option<Version> {
        parse_version(&self.version)
    }

    /// File name of the distributable installer, e.g. `HelloApp-1.0.0-setup.exe`.
    pub fn installer_file_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .collect();
        format!("{}-{}-setup.exe", name, self.version.trim())
    }
}

/// One extension registered to open with the installed executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAssociation {
    /// Extension including the leading dot, e.g. `.hello`.
    pub extension: String,
    /// Programmatic identifier, e.g. `HelloApp.Document`.
    pub prog_id: String,
    pub display_name: String,
    /// Icon template. Defaults to `{exe},0`.
    #[serde(default)]
    pub icon: Option<String>,
    /// Open command template. Defaults to `"{exe}" "%1"`.
    #[serde(default)]
    pub open_command: Option<String>,
}

impl FileAssociation {
    pub fn icon_value(&self, target: &InstallTarget) -> String {
        let template = self.icon.as_deref().unwrap_or("{exe},0");
        expand_template(template, target)
    }

    pub fn command_value(&self, target: &InstallTarget) -> String {
        let template = self.open_command.as_deref().unwrap_or("\"{exe}\" \"%1\"");
        expand_template(template, target)
    }
}

fn expand_template(template: &str, target: &InstallTarget) -> String {
    template
        .replace("{exe}", &target.executable.to_string_lossy())
        .replace("{app}", &target.root.to_string_lossy())
}

/// Optional tasks. The manifest holds the defaults, the user may flip each one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSelection {
    #[serde(default)]
    pub desktop_icon: bool,
}

impl TaskSelection {
    /// Applies the user's answer on top of these defaults. `None` keeps the default.
    pub fn with_choice(self, desktop_icon: Option<bool>) -> Self {
        Self { desktop_icon: desktop_icon.unwrap_or(self.desktop_icon) }
    }
}

/// Where the product lands on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub root: PathBuf,
    pub executable: PathBuf,
}

impl InstallTarget {
    pub fn new(root: &Path, manifest: &Manifest) -> Self {
        Self {
            root: root.to_path_buf(),
            executable: root.join(&manifest.executable),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub identity: AppIdentity,
    /// Build output directory holding the executable and its payload directory.
    pub source_dir: PathBuf,
    /// Executable file name inside `source_dir`.
    pub executable: String,
    /// Runtime payload directory inside `source_dir` (e.g. `_internal`).
    #[serde(default)]
    pub payload_dir: Option<String>,
    #[serde(default)]
    pub associations: Vec<FileAssociation>,
    #[serde(default)]
    pub tasks: TaskSelection,
    #[serde(default = "default_require_admin")]
    pub require_admin: bool,
    /// Directory name under Program Files / LocalAppData. Defaults to the product name.
    #[serde(default)]
    pub default_dir_name: Option<String>,
}

fn default_require_admin() -> bool {
    true
}

impl Manifest {
    /// Reads, resolves and validates a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        if manifest.source_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            manifest.source_dir = base.join(&manifest.source_dir);
        }
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), InstallError> {
        let invalid = |msg: String| Err(InstallError::InvalidManifest(msg));
        let id = &self.identity;
        if id.id.trim().is_empty() {
            return invalid("identity.id is empty".into());
        }
        if id.name.trim().is_empty() {
            return invalid("identity.name is empty".into());
        }
        if id.parsed_version().is_none() {
            return invalid(format!("identity.version '{}' is not a version", id.version));
        }
        if !is_bare_file_name(&self.executable) {
            return invalid(format!("executable '{}' must be a bare file name", self.executable));
        }
        if let Some(dir) = &self.payload_dir {
            if !is_contained_relative(dir) {
                return invalid(format!("payload_dir '{dir}' must be a relative path inside the build output"));
            }
        }
        for assoc in &self.associations {
            let ext = &assoc.extension;
            if !ext.starts_with('.') || ext.len() < 2 || ext.contains(['\\', '/']) {
                return invalid(format!("extension '{ext}' must look like '.ext'"));
            }
            if assoc.prog_id.trim().is_empty() || assoc.prog_id.contains('\\') {
                return invalid(format!("prog_id '{}' is not a valid identifier", assoc.prog_id));
            }
        }
        Ok(())
    }

    pub fn dir_name(&self) -> &str {
        self.default_dir_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.identity.name)
    }

    pub fn source_executable(&self) -> PathBuf {
        self.source_dir.join(&self.executable)
    }

    pub fn source_payload(&self) -> Option<PathBuf> {
        self.payload_dir.as_ref().map(|d| self.source_dir.join(d))
    }
}

/// Parses a version, padding missing minor/patch components with zeros.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let mut padded = parts.clone();
    padded.resize(3, "0");
    Version::parse(&padded.join(".")).ok()
}

fn is_bare_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.trim().is_empty()
        && !name.contains(['\\', '/'])
        && path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)))
}

fn is_contained_relative(dir: &str) -> bool {
    let path = Path::new(dir);
    !dir.trim().is_empty()
        && !dir.contains(':')
        && !dir.starts_with(['\\', '/'])
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
pub(crate) fn sample_manifest(source_dir: &Path) -> Manifest {
    Manifest {
        identity: AppIdentity {
            id: "{8F3E5C1A-HELLO-APP}".into(),
            name: "HelloApp".into(),
            version: "1.0.0".into(),
            publisher: "Hello Labs".into(),
            url: "https://example.com/hello".into(),
        },
        source_dir: source_dir.to_path_buf(),
        executable: "HelloApp.exe".into(),
        payload_dir: Some("_internal".into()),
        associations: vec![FileAssociation {
            extension: ".hello".into(),
            prog_id: "HelloApp.Document".into(),
            display_name: "Hello Document".into(),
            icon: None,
            open_command: None,
        }],
        tasks: TaskSelection::default(),
        require_admin: false,
        default_dir_name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn load_resolves_relative_source_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest_path = tmp.path().join("hello.json");
        std::fs::write(
            &manifest_path,
            r#"{
                "identity": { "id": "{ABC}", "name": "HelloApp", "version": "1.0" },
                "source_dir": "dist/HelloApp",
                "executable": "HelloApp.exe",
                "payload_dir": "_internal",
                "associations": [
                    { "extension": ".hello", "prog_id": "HelloApp.Document", "display_name": "Hello Document" }
                ]
            }"#,
        )
        .unwrap();

        let manifest = Manifest::load(&manifest_path).unwrap();
        assert_eq!(manifest.source_dir, tmp.path().join("dist/HelloApp"));
        assert!(manifest.require_admin);
        assert!(!manifest.tasks.desktop_icon);
        assert_eq!(manifest.dir_name(), "HelloApp");
        assert_eq!(manifest.identity.parsed_version(), Some(Version::new(1, 0, 0)));
    }

    #[test]
    fn validate_rejects_nested_executable() {
        let mut m = sample_manifest(Path::new("dist"));
        m.executable = r"bin\HelloApp.exe".into();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("bare file name"));
    }

    #[test]
    fn validate_rejects_escaping_payload_dir() {
        let mut m = sample_manifest(Path::new("dist"));
        m.payload_dir = Some("../elsewhere".into());
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_rejects_extension_without_dot() {
        let mut m = sample_manifest(Path::new("dist"));
        m.associations[0].extension = "hello".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn default_templates_match_registry_layout() {
        let m = sample_manifest(Path::new("dist"));
        let target = InstallTarget::new(Path::new(r"C:\Program Files\HelloApp"), &m);
        let assoc = &m.associations[0];
        let exe = target.executable.to_string_lossy().to_string();
        assert_eq!(assoc.icon_value(&target), format!("{exe},0"));
        assert_eq!(assoc.command_value(&target), format!("\"{exe}\" \"%1\""));
    }

    #[test]
    fn installer_file_name_embeds_name_and_version() {
        let m = sample_manifest(Path::new("dist"));
        assert_eq!(m.identity.installer_file_name(), "HelloApp-1.0.0-setup.exe");
    }

    #[test]
    fn user_choice_overrides_desktop_default() {
        let checked = TaskSelection { desktop_icon: true };
        assert!(!checked.with_choice(Some(false)).desktop_icon);
        assert!(checked.with_choice(None).desktop_icon);
        assert!(TaskSelection::default().with_choice(Some(true)).desktop_icon);
    }

    proptest! {
        #[test]
        fn parse_version_pads_short_versions(major in 0u64..100, minor in 0u64..100) {
            let v = parse_version(&format!("{major}.{minor}")).unwrap();
            prop_assert_eq!(v, Version::new(major, minor, 0));
        }

        #[test]
        fn parse_version_rejects_words(word in "[a-uw-z]{1,8}") {
            prop_assert!(parse_version(&word).is_none());
        }
    }
}
