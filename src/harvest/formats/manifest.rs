//! Flatpak manifest reader (JSON or YAML).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::harvest::traits::{FormatError, FormatExtract, PackageFormat};
use crate::model::dedup_preserving_order;

/// Manifest file names, in lookup priority order. `{id}` is the app id.
pub const MANIFEST_CANDIDATES: &[&str] = &[
    "{id}.yml",
    "{id}.yaml",
    "{id}.json",
    "org.flatpak.Manifest.json",
    "manifest.json",
    "manifest.yml",
];

/// `org.gnome.Calculator` -> `calculator`; `None` for ids with fewer than
/// three dot-separated parts.
pub fn package_name_from_app_id(app_id: &str) -> Option<String> {
    let parts: Vec<&str> = app_id.split('.').collect();
    if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    parts.last().map(|last| last.to_lowercase())
}

/// A module entry: inline definition or path to a separate file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ModuleEntry {
    Inline(Module),
    File(String),
}

#[derive(Debug, Clone, Deserialize)]
struct Module {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    modules: Vec<ModuleEntry>,
}

impl ModuleEntry {
    fn name(&self) -> Option<String> {
        match self {
            ModuleEntry::Inline(module) => module.name.clone(),
            ModuleEntry::File(path) => Path::new(path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
        }
    }

    /// Pre-order: the module, then its nested modules.
    fn collect_names(&self, out: &mut Vec<String>) {
        if let Some(name) = self.name() {
            out.push(name);
        }
        if let ModuleEntry::Inline(module) = self {
            for nested in &module.modules {
                nested.collect_names(out);
            }
        }
    }
}

/// Fields of a Flatpak build manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlatpakManifest {
    #[serde(alias = "id")]
    pub app_id: Option<String>,
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    pub sdk: Option<String>,
    pub base: Option<String>,
    pub base_version: Option<String>,
    #[serde(default)]
    pub sdk_extensions: Vec<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub finish_args: Vec<String>,
    #[serde(default)]
    modules: Vec<ModuleEntry>,
}

impl FlatpakManifest {
    /// Parses JSON, falling back to YAML.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(json_err) => serde_yaml::from_str(text).map_err(|yaml_err| {
                FormatError::MalformedManifest(format!(
                    "not JSON ({}) nor YAML ({})",
                    json_err, yaml_err
                ))
            })?,
        };
        if !value.is_object() {
            return Err(FormatError::MalformedManifest(
                "top level is not a mapping".to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|e| FormatError::MalformedManifest(e.to_string()))
    }

    /// Runtime, SDK, base and SDK extensions, in `name//version` form when
    /// a version is declared.
    pub fn frameworks(&self) -> Vec<String> {
        let versioned = |name: &Option<String>, version: &Option<String>| {
            name.as_ref().map(|n| match version {
                Some(v) => format!("{}//{}", n, v),
                None => n.clone(),
            })
        };
        let mut out = Vec::new();
        out.extend(versioned(&self.runtime, &self.runtime_version));
        out.extend(versioned(&self.sdk, &self.runtime_version));
        out.extend(versioned(&self.base, &self.base_version));
        out.extend(self.sdk_extensions.iter().cloned());
        dedup_preserving_order(out)
    }

    /// Every module name in declaration order, nested modules included,
    /// except the last top-level module (the application itself).
    pub fn dependencies(&self) -> Vec<String> {
        let mut names = Vec::new();
        let deps = match self.modules.split_last() {
            Some((_, deps)) => deps,
            None => &[],
        };
        for module in deps {
            module.collect_names(&mut names);
        }
        dedup_preserving_order(names)
    }

    pub fn into_extract(self) -> FormatExtract {
        let mut raw = BTreeMap::new();
        if let Some(command) = &self.command {
            raw.insert("command".to_string(), Value::from(command.clone()));
        }
        if !self.finish_args.is_empty() {
            raw.insert("finish_args".to_string(), Value::from(self.finish_args.clone()));
        }
        if let Some(runtime) = &self.runtime {
            raw.insert("runtime".to_string(), Value::from(runtime.clone()));
        }
        if let Some(version) = &self.runtime_version {
            raw.insert("runtime_version".to_string(), Value::from(version.clone()));
        }
        if let Some(app) = self.modules.last().and_then(ModuleEntry::name) {
            raw.insert("app_module".to_string(), Value::from(app));
        }

        FormatExtract {
            frameworks: self.frameworks(),
            dependencies: self.dependencies(),
            name: self.app_id,
            version: None,
            description: None,
            build_dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            raw,
        }
    }
}

/// [`PackageFormat`] for Flatpak manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestFormat;

impl PackageFormat for ManifestFormat {
    fn name(&self) -> &str {
        "flatpak-manifest"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| matches!(ext, "json" | "yml" | "yaml"))
    }

    fn extract(&self, text: &str) -> Result<FormatExtract, FormatError> {
        Ok(FlatpakManifest::parse(text)?.into_extract())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
app-id: org.gnome.Calculator
runtime: org.gnome.Platform
runtime-version: '46'
sdk: org.gnome.Sdk
command: gnome-calculator
finish-args:
  - --share=ipc
  - --socket=wayland
modules:
  - name: mpfr
    sources:
      - type: archive
        url: https://example.org/mpfr.tar.xz
  - name: libsoup
    modules:
      - name: libpsl
  - shared-modules/libsecret/libsecret.json
  - name: gnome-calculator
    buildsystem: meson
"#;

    #[test]
    fn test_yaml_manifest() {
        let extract = ManifestFormat.extract(YAML).unwrap();
        assert_eq!(extract.name.as_deref(), Some("org.gnome.Calculator"));
        assert_eq!(
            extract.frameworks,
            vec!["org.gnome.Platform//46", "org.gnome.Sdk//46"]
        );
        assert_eq!(extract.dependencies, vec!["mpfr", "libsoup", "libpsl", "libsecret"]);
        assert_eq!(extract.raw["command"], "gnome-calculator");
        assert_eq!(extract.raw["app_module"], "gnome-calculator");
        assert_eq!(extract.version, None);
    }

    #[test]
    fn test_json_manifest_with_id_alias_and_extensions() {
        let json = r#"{
            "id": "org.example.Editor",
            "runtime": "org.freedesktop.Platform",
            "runtime-version": "23.08",
            "sdk": "org.freedesktop.Sdk",
            "sdk-extensions": ["org.freedesktop.Sdk.Extension.rust-stable"],
            "modules": [{ "name": "editor" }]
        }"#;
        let extract = ManifestFormat.extract(json).unwrap();
        assert_eq!(extract.name.as_deref(), Some("org.example.Editor"));
        assert_eq!(extract.frameworks.len(), 3);
        assert_eq!(extract.frameworks[2], "org.freedesktop.Sdk.Extension.rust-stable");
        assert!(extract.dependencies.is_empty());
    }

    #[test]
    fn test_malformed_manifest() {
        let err = ManifestFormat.extract("{ \"app-id\": [unclosed").unwrap_err();
        assert!(matches!(err, FormatError::MalformedManifest(_)));
        assert!(ManifestFormat.extract("- just\n- a list\n").is_err());
    }

    #[test]
    fn test_package_name_from_app_id() {
        assert_eq!(package_name_from_app_id("org.gnome.Calculator").as_deref(), Some("calculator"));
        assert_eq!(package_name_from_app_id("com.github.user.AppName").as_deref(), Some("appname"));
        assert_eq!(package_name_from_app_id("flathub.org"), None);
    }

    #[test]
    fn test_can_handle() {
        assert!(ManifestFormat.can_handle(Path::new("org.gnome.Calculator.yml")));
        assert!(!ManifestFormat.can_handle(Path::new("PKGBUILD")));
    }
}
