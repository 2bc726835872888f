use std::fmt;

use super::stage::BuildStage;

/// Packages installed through apt with index caches purged in the same layer.
fn apt_install_command(packages: &[String]) -> String {
    format!(
        "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
        packages.join(" ")
    )
}

/// One declarative build action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From { image: String },
    SystemPackages { packages: Vec<String> },
    Workdir { path: String },
    CopyManifest { files: Vec<String> },
    Install { command: String },
    CopyPayload,
    Env { vars: Vec<(String, String)> },
    Expose { port: u16 },
    Cmd { argv: Vec<String> },
}

impl Instruction {
    pub fn stage(&self) -> BuildStage {
        match self {
            Instruction::From { .. } => BuildStage::BaseSelected,
            Instruction::SystemPackages { .. } => BuildStage::SystemPackagesInstalled,
            Instruction::Workdir { .. } => BuildStage::WorkdirSet,
            Instruction::CopyManifest { .. } => BuildStage::ManifestCopied,
            Instruction::Install { .. } => BuildStage::DepsInstalled,
            Instruction::CopyPayload => BuildStage::PayloadCopied,
            Instruction::Env { .. } => BuildStage::EnvConfigured,
            Instruction::Expose { .. } => BuildStage::PortDeclared,
            Instruction::Cmd { .. } => BuildStage::EntrypointSet,
        }
    }

    /// Shell command executed inside the staged root filesystem.
    pub fn shell_command(&self) -> Option<String> {
        match self {
            Instruction::SystemPackages { packages } if !packages.is_empty() => {
                Some(apt_install_command(packages))
            }
            Instruction::Install { command } => Some(command.clone()),
            _ => None,
        }
    }

    /// True when the step contributes a filesystem layer of its own.
    pub fn produces_layer(&self) -> bool {
        match self {
            Instruction::SystemPackages { packages } => !packages.is_empty(),
            Instruction::Workdir { .. }
            | Instruction::CopyManifest { .. }
            | Instruction::Install { .. }
            | Instruction::CopyPayload => true,
            Instruction::From { .. }
            | Instruction::Env { .. }
            | Instruction::Expose { .. }
            | Instruction::Cmd { .. } => false,
        }
    }

    /// True for steps that do nothing with this recipe.
    pub fn is_noop(&self) -> bool {
        matches!(self, Instruction::SystemPackages { packages } if packages.is_empty())
    }

    /// Containerfile line, or `None` when the step renders to nothing.
    pub fn containerfile_line(&self) -> Option<String> {
        let line = match self {
            Instruction::From { image } => format!("FROM {image}"),
            Instruction::SystemPackages { packages } if packages.is_empty() => return None,
            Instruction::SystemPackages { packages } => {
                format!("RUN {}", apt_install_command(packages))
            }
            Instruction::Workdir { path } => format!("WORKDIR {path}"),
            Instruction::CopyManifest { files } => format!("COPY {} ./", files.join(" ")),
            Instruction::Install { command } => format!("RUN {command}"),
            Instruction::CopyPayload => "COPY . .".to_string(),
            Instruction::Env { vars } if vars.is_empty() => return None,
            Instruction::Env { vars } => {
                let pairs: Vec<String> = vars
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, quote_env_value(v)))
                    .collect();
                format!("ENV {}", pairs.join(" \\\n    "))
            }
            Instruction::Expose { port } => format!("EXPOSE {port}"),
            Instruction::Cmd { argv } => {
                let quoted: Vec<String> = argv
                    .iter()
                    .map(|a| serde_json::Value::String(a.clone()).to_string())
                    .collect();
                format!("CMD [{}]", quoted.join(", "))
            }
        };
        Some(line)
    }

    /// Stable text hashed into the cache key.
    pub fn cache_text(&self) -> String {
        match self {
            Instruction::SystemPackages { packages } if packages.is_empty() => {
                "SYSTEM_PACKAGES none".to_string()
            }
            other => other
                .containerfile_line()
                .unwrap_or_else(|| other.stage().as_str().to_string()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.containerfile_line() {
            Some(line) => f.write_str(&line),
            None => write!(f, "# {}: nothing to do", self.stage()),
        }
    }
}

pub(crate) fn quote_env_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:,@+".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_system_packages_is_noop() {
        let step = Instruction::SystemPackages { packages: vec![] };
        assert!(step.is_noop());
        assert!(!step.produces_layer());
        assert!(step.shell_command().is_none());
        assert!(step.containerfile_line().is_none());
        assert_eq!(step.cache_text(), "SYSTEM_PACKAGES none");
    }

    #[test]
    fn test_system_packages_purge_lists_in_same_command() {
        let step = Instruction::SystemPackages {
            packages: vec!["build-essential".into(), "curl".into()],
        };
        let cmd = step.shell_command().unwrap();
        assert!(cmd.contains("--no-install-recommends build-essential curl"));
        assert!(cmd.ends_with("rm -rf /var/lib/apt/lists/*"));
    }

    #[test]
    fn test_env_quoting() {
        let step = Instruction::Env {
            vars: vec![
                ("A".into(), "true".into()),
                ("B".into(), "two words".into()),
            ],
        };
        assert_eq!(
            step.to_string(),
            "ENV A=true \\\n    B=\"two words\""
        );
    }

    #[test]
    fn test_cmd_is_exec_form() {
        let step = Instruction::Cmd {
            argv: vec!["streamlit".into(), "run".into(), "app.py".into()],
        };
        assert_eq!(step.to_string(), r#"CMD ["streamlit", "run", "app.py"]"#);
        assert!(!step.produces_layer());
    }
}
