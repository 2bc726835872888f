//! Declarative build recipe.
//!
//! A recipe is the data form of the build steps: every field defaults to
//! the packaged dashboard's recipe, so an empty `dockwright.yaml` (or none
//! at all) builds the same image.

pub mod reference;
pub mod render;

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use dockwright_shared::constants::{envs, recipe as defaults, server};
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::launcher::{ServerConfig, StartupCommand};
use crate::pipeline::Instruction;

pub use reference::BaseImageRef;
pub use render::{render_containerfile, render_dockerignore};

/// Dependency manifest files and the command that installs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManifestSpec {
    /// Files copied before installation, relative to the build context.
    pub files: Vec<String>,

    /// Shell command run in the working directory.
    pub install: String,
}

impl Default for ManifestSpec {
    fn default() -> Self {
        Self {
            files: vec![defaults::MANIFEST.to_string()],
            install: defaults::INSTALL_COMMAND.to_string(),
        }
    }
}

/// How the application server is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntrypointSpec {
    pub program: String,
    pub entry_module: String,
    pub disable_file_watch: bool,
    pub extra_args: Vec<String>,
}

impl Default for EntrypointSpec {
    fn default() -> Self {
        Self {
            program: server::PROGRAM.to_string(),
            entry_module: defaults::ENTRY_MODULE.to_string(),
            disable_file_watch: true,
            extra_args: Vec::new(),
        }
    }
}

/// The complete build recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildRecipe {
    /// Pinned base runtime reference.
    pub base: String,

    /// OS packages installed before dependencies. Empty skips the step.
    pub system_packages: Vec<String>,

    /// Absolute working directory inside the image.
    pub workdir: String,

    pub manifest: ManifestSpec,

    /// Context paths never copied into the payload layer.
    pub exclude: Vec<String>,

    pub server: ServerConfig,

    /// Additional image environment.
    pub env: BTreeMap<String, String>,

    /// Declared exposed TCP port. Must equal `server.port`.
    pub expose: u16,

    pub entrypoint: EntrypointSpec,

    pub labels: BTreeMap<String, String>,
}

impl Default for BuildRecipe {
    fn default() -> Self {
        Self {
            base: defaults::BASE_IMAGE.to_string(),
            system_packages: Vec::new(),
            workdir: defaults::WORKDIR.to_string(),
            manifest: ManifestSpec::default(),
            exclude: defaults::DEFAULT_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            server: ServerConfig::default(),
            env: BTreeMap::new(),
            expose: server::DEFAULT_PORT,
            entrypoint: EntrypointSpec::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl BuildRecipe {
    /// Load a recipe from a YAML file.
    pub fn load(path: &Path) -> DockwrightResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DockwrightError::Recipe(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
            .map_err(|e| DockwrightError::Recipe(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(content: &str) -> DockwrightResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| DockwrightError::Recipe(e.to_string()))
    }

    pub fn to_yaml(&self) -> DockwrightResult<String> {
        serde_yaml::to_string(self).map_err(|e| DockwrightError::Internal(e.to_string()))
    }

    /// The recipe file in `context_dir`, or the built-in defaults.
    pub fn discover(context_dir: &Path) -> DockwrightResult<Self> {
        let path = context_dir.join(defaults::RECIPE_FILE);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "Loading recipe");
            Self::load(&path)
        } else {
            tracing::debug!(context = %context_dir.display(), "No recipe file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn base_ref(&self) -> DockwrightResult<BaseImageRef> {
        BaseImageRef::parse(&self.base)
    }

    /// Check the recipe invariants.
    pub fn validate(&self) -> DockwrightResult<()> {
        self.base_ref()?;

        if !self.workdir.starts_with('/') || has_parent_component(&self.workdir) {
            return Err(DockwrightError::Recipe(format!(
                "workdir must be an absolute path without '..': {}",
                self.workdir
            )));
        }

        if self.manifest.files.is_empty() {
            return Err(DockwrightError::Recipe(
                "at least one dependency manifest file is required".to_string(),
            ));
        }
        for file in &self.manifest.files {
            check_context_path("manifest file", file)?;
        }
        if self.manifest.install.trim().is_empty() {
            return Err(DockwrightError::Recipe(
                "dependency install command is empty".to_string(),
            ));
        }

        for pattern in &self.exclude {
            check_context_path("exclude entry", pattern)?;
        }

        for package in &self.system_packages {
            if !is_valid_package(package) {
                return Err(DockwrightError::Recipe(format!(
                    "invalid system package name: '{package}'"
                )));
            }
        }

        if self.server.port == 0 {
            return Err(DockwrightError::Recipe("server port must not be 0".to_string()));
        }
        if !self.server.is_wildcard() {
            return Err(DockwrightError::Recipe(format!(
                "server address {} is not a wildcard address; the server would be unreachable from outside the container",
                self.server.address
            )));
        }
        if self.expose != self.server.port {
            return Err(DockwrightError::Recipe(format!(
                "exposed port {} does not match server port {}",
                self.expose, self.server.port
            )));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
                return Err(DockwrightError::Recipe(format!(
                    "invalid environment variable name: '{key}'"
                )));
            }
            if [envs::SERVER_HEADLESS, envs::SERVER_PORT, envs::SERVER_ADDRESS]
                .contains(&key.as_str())
            {
                return Err(DockwrightError::Recipe(format!(
                    "{key} is derived from the server section and cannot be set in env"
                )));
            }
        }

        if self.entrypoint.program.trim().is_empty() {
            return Err(DockwrightError::Recipe(
                "entrypoint program is empty".to_string(),
            ));
        }
        check_context_path("entry module", &self.entrypoint.entry_module)?;

        Ok(())
    }

    /// Image environment: server settings first, then recipe extras.
    pub fn runtime_env(&self) -> Vec<(String, String)> {
        let mut env = self.server.env_pairs();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn startup_command(&self) -> StartupCommand {
        StartupCommand::run_module(
            &self.entrypoint.program,
            &self.entrypoint.entry_module,
            self.entrypoint.disable_file_watch,
            &self.entrypoint.extra_args,
        )
    }

    /// The nine build instructions in execution order.
    pub fn instructions(&self) -> Vec<Instruction> {
        vec![
            Instruction::From {
                image: self.base.clone(),
            },
            Instruction::SystemPackages {
                packages: self.system_packages.clone(),
            },
            Instruction::Workdir {
                path: self.workdir.clone(),
            },
            Instruction::CopyManifest {
                files: self.manifest.files.clone(),
            },
            Instruction::Install {
                command: self.manifest.install.clone(),
            },
            Instruction::CopyPayload,
            Instruction::Env {
                vars: self.runtime_env(),
            },
            Instruction::Expose { port: self.expose },
            Instruction::Cmd {
                argv: self.startup_command().argv(),
            },
        ]
    }
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn check_context_path(what: &str, path: &str) -> DockwrightResult<()> {
    if path.trim().is_empty() || path.starts_with('/') || has_parent_component(path) {
        return Err(DockwrightError::Recipe(format!(
            "{what} must be a relative path inside the build context: '{path}'"
        )));
    }
    Ok(())
}

/// Debian package name, optionally pinned with `=version`.
fn is_valid_package(spec: &str) -> bool {
    let (name, version) = match spec.split_once('=') {
        Some((name, version)) => (name, Some(version)),
        None => (spec, None),
    };

    let name_ok = name.len() >= 2
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c));

    let version_ok = version.is_none_or(|v| {
        !v.is_empty()
            && v
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || ".+~:-".contains(c))
    });

    name_ok && version_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_default_recipe_is_valid() {
        let recipe = BuildRecipe::default();
        recipe.validate().unwrap();
        assert_eq!(recipe.expose, recipe.server.port);
        assert_eq!(recipe.expose, 8501);
    }

    #[test]
    fn test_empty_yaml_yields_defaults() {
        assert_eq!(BuildRecipe::from_yaml("").unwrap(), BuildRecipe::default());
        assert_eq!(BuildRecipe::from_yaml("{}").unwrap(), BuildRecipe::default());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let recipe = BuildRecipe::from_yaml(
            "system_packages: [build-essential]\nserver:\n  port: 9000\nexpose: 9000\n",
        )
        .unwrap();
        assert_eq!(recipe.system_packages, vec!["build-essential"]);
        assert_eq!(recipe.server.port, 9000);
        assert_eq!(recipe.workdir, "/app");
        recipe.validate().unwrap();
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = BuildRecipe::from_yaml("bsae: python:3.11.9\n").unwrap_err();
        assert!(matches!(err, DockwrightError::Recipe(_)));
    }

    #[test]
    fn test_port_mismatch_rejected() {
        let recipe = BuildRecipe {
            expose: 8080,
            ..Default::default()
        };
        let err = recipe.validate().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_non_wildcard_address_rejected() {
        let mut recipe = BuildRecipe::default();
        recipe.server.address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_floating_base_rejected() {
        let recipe = BuildRecipe {
            base: "python:latest".into(),
            ..Default::default()
        };
        assert!(matches!(recipe.validate(), Err(DockwrightError::Recipe(_))));
    }

    #[test]
    fn test_paths_must_stay_in_context() {
        let mut recipe = BuildRecipe::default();
        recipe.manifest.files = vec!["../requirements.txt".into()];
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default();
        recipe.workdir = "app".into();
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default();
        recipe.entrypoint.entry_module = "/abs/app.py".into();
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_reserved_env_rejected() {
        let mut recipe = BuildRecipe::default();
        recipe
            .env
            .insert("STREAMLIT_SERVER_PORT".into(), "1".into());
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default();
        recipe.env.insert("API_BASE".into(), "http://api".into());
        recipe.validate().unwrap();
        let env = recipe.runtime_env();
        assert_eq!(env[0].0, "STREAMLIT_SERVER_HEADLESS");
        assert_eq!(env.last().unwrap().0, "API_BASE");
    }

    #[test]
    fn test_package_names() {
        assert!(is_valid_package("build-essential"));
        assert!(is_valid_package("libpq-dev=15.4-0+deb12u1"));
        assert!(is_valid_package("g++"));
        assert!(!is_valid_package("curl; rm -rf /"));
        assert!(!is_valid_package("Curl"));
        assert!(!is_valid_package("gcc="));
    }

    #[test]
    fn test_instructions_in_order() {
        let names: Vec<&str> = BuildRecipe::default()
            .instructions()
            .iter()
            .map(|i| i.stage().as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "BASE_SELECTED",
                "SYSTEM_PACKAGES_INSTALLED",
                "WORKDIR_SET",
                "MANIFEST_COPIED",
                "DEPS_INSTALLED",
                "PAYLOAD_COPIED",
                "ENV_CONFIGURED",
                "PORT_DECLARED",
                "ENTRYPOINT_SET",
            ]
        );
    }

    #[test]
    fn test_discover_reads_context_file() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(
            BuildRecipe::discover(temp.path()).unwrap(),
            BuildRecipe::default()
        );

        std::fs::write(
            temp.path().join("dockwright.yaml"),
            "entrypoint:\n  entry_module: dashboard.py\n",
        )
        .unwrap();
        let recipe = BuildRecipe::discover(temp.path()).unwrap();
        assert_eq!(recipe.entrypoint.entry_module, "dashboard.py");
        assert!(recipe.entrypoint.disable_file_watch);
    }

    #[test]
    fn test_yaml_round_trip_of_defaults() {
        let yaml = BuildRecipe::default().to_yaml().unwrap();
        assert!(yaml.contains("python:3.11.9-slim"));
        assert_eq!(BuildRecipe::from_yaml(&yaml).unwrap(), BuildRecipe::default());
    }
}
