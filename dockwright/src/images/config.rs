//! Runtime configuration carried in an image config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use super::manifest::{EmptyObject, ExecConfig};

/// Runtime parameters of an image: what the base ships with, then what the
/// build adds on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRuntimeConfig {
    /// `KEY=VALUE` entries, in order.
    pub env: Vec<String>,

    pub working_dir: String,

    pub entrypoint: Vec<String>,

    pub cmd: Vec<String>,

    /// Exposed ports (e.g. `["8501/tcp"]`).
    pub exposed_ports: Vec<String>,

    pub labels: BTreeMap<String, String>,

    pub user: Option<String>,
}

impl Default for ImageRuntimeConfig {
    fn default() -> Self {
        Self {
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ],
            working_dir: "/".to_string(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            exposed_ports: Vec::new(),
            labels: BTreeMap::new(),
            user: None,
        }
    }
}

impl ImageRuntimeConfig {
    /// Parse `"8501/tcp"`, `"53/udp"` or a bare `"8080"` (TCP).
    pub fn parse_exposed_port(port_spec: &str) -> Option<(u16, &str)> {
        let mut parts = port_spec.split('/');
        let port: u16 = parts.next()?.parse().ok()?;
        let protocol = parts.next().unwrap_or("tcp");
        Some((port, protocol))
    }

    pub fn tcp_ports(&self) -> Vec<u16> {
        self.exposed_ports
            .iter()
            .filter_map(|spec| Self::parse_exposed_port(spec))
            .filter(|(_, protocol)| *protocol == "tcp")
            .map(|(port, _)| port)
            .collect()
    }

    /// Declare `port/tcp` if it is not already exposed.
    pub fn expose_tcp(&mut self, port: u16) {
        if !self.tcp_ports().contains(&port) {
            self.exposed_ports.push(format!("{port}/tcp"));
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Overlay `vars` onto the environment.
    ///
    /// Existing keys are replaced in place; new keys are appended in the
    /// order given, so the result is deterministic.
    pub fn merge_env(&mut self, vars: &[(String, String)]) {
        for (key, value) in vars {
            let entry = format!("{key}={value}");
            match self
                .env
                .iter()
                .position(|e| e.split_once('=').map(|(k, _)| k) == Some(key.as_str()))
            {
                Some(pos) => self.env[pos] = entry,
                None => self.env.push(entry),
            }
        }
    }

    /// Extract the runtime parameters from a base image's OCI config.
    pub fn from_oci_config(
        image_config: &oci_spec::image::ImageConfiguration,
    ) -> DockwrightResult<Self> {
        let Some(config) = image_config.config().as_ref() else {
            tracing::debug!("Base image config has no runtime section, using defaults");
            return Ok(Self::default());
        };

        let defaults = Self::default();

        let env = config.env().clone().unwrap_or(defaults.env);
        let working_dir = config
            .working_dir()
            .as_ref()
            .filter(|dir| !dir.is_empty())
            .cloned()
            .unwrap_or(defaults.working_dir);

        if !working_dir.starts_with('/') {
            return Err(DockwrightError::Storage(format!(
                "base image working directory is not absolute: {working_dir}"
            )));
        }

        Ok(Self {
            env,
            working_dir,
            entrypoint: config.entrypoint().clone().unwrap_or_default(),
            cmd: config.cmd().clone().unwrap_or_default(),
            exposed_ports: config.exposed_ports().clone().unwrap_or_default(),
            labels: config
                .labels()
                .clone()
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
            user: config.user().clone().filter(|u| !u.is_empty()),
        })
    }

    /// The `config` section of an OCI image config document.
    pub fn to_exec_config(&self) -> ExecConfig {
        ExecConfig {
            user: self.user.clone(),
            exposed_ports: self
                .exposed_ports
                .iter()
                .map(|p| {
                    let spec = if p.contains('/') { p.clone() } else { format!("{p}/tcp") };
                    (spec, EmptyObject {})
                })
                .collect(),
            env: self.env.clone(),
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
            working_dir: self.working_dir.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn from_exec_config(exec: &ExecConfig) -> Self {
        Self {
            env: exec.env.clone(),
            working_dir: if exec.working_dir.is_empty() {
                "/".to_string()
            } else {
                exec.working_dir.clone()
            },
            entrypoint: exec.entrypoint.clone(),
            cmd: exec.cmd.clone(),
            exposed_ports: exec.exposed_ports.keys().cloned().collect(),
            labels: exec.labels.clone(),
            user: exec.user.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exposed_port() {
        assert_eq!(
            ImageRuntimeConfig::parse_exposed_port("8501/tcp"),
            Some((8501, "tcp"))
        );
        assert_eq!(
            ImageRuntimeConfig::parse_exposed_port("53/udp"),
            Some((53, "udp"))
        );
        assert_eq!(
            ImageRuntimeConfig::parse_exposed_port("8080"),
            Some((8080, "tcp"))
        );
        assert_eq!(ImageRuntimeConfig::parse_exposed_port("http"), None);
    }

    #[test]
    fn test_expose_tcp_is_idempotent() {
        let mut config = ImageRuntimeConfig::default();
        config.exposed_ports.push("53/udp".into());
        config.expose_tcp(8501);
        config.expose_tcp(8501);
        assert_eq!(config.tcp_ports(), vec![8501]);
        assert_eq!(config.exposed_ports.len(), 2);
    }

    #[test]
    fn test_merge_env_replaces_in_place() {
        let mut config = ImageRuntimeConfig {
            env: vec!["PATH=/usr/bin".into(), "LANG=C.UTF-8".into()],
            ..Default::default()
        };
        config.merge_env(&[
            ("LANG".into(), "en_US.UTF-8".into()),
            ("STREAMLIT_SERVER_PORT".into(), "8501".into()),
        ]);
        assert_eq!(
            config.env,
            vec!["PATH=/usr/bin", "LANG=en_US.UTF-8", "STREAMLIT_SERVER_PORT=8501"]
        );
        assert_eq!(config.env_value("LANG"), Some("en_US.UTF-8"));
        assert_eq!(config.env_value("MISSING"), None);
    }

    #[test]
    fn test_from_oci_config() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin", "PYTHON_VERSION=3.11.9"],
                "Cmd": ["python3"],
                "WorkingDir": ""
            },
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#;
        let image_config: oci_spec::image::ImageConfiguration =
            serde_json::from_str(raw).unwrap();
        let config = ImageRuntimeConfig::from_oci_config(&image_config).unwrap();

        assert_eq!(config.cmd, vec!["python3"]);
        assert_eq!(config.working_dir, "/");
        assert_eq!(config.env_value("PYTHON_VERSION"), Some("3.11.9"));
        assert!(config.entrypoint.is_empty());
    }

    #[test]
    fn test_exec_config_round_trip() {
        let mut config = ImageRuntimeConfig::default();
        config.expose_tcp(8501);
        config.working_dir = "/app".into();
        config.cmd = vec!["streamlit".into(), "run".into(), "app.py".into()];

        let exec = config.to_exec_config();
        assert!(exec.exposed_ports.contains_key("8501/tcp"));
        assert_eq!(ImageRuntimeConfig::from_exec_config(&exec), config);
    }
}
