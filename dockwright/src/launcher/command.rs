use std::fmt;

use serde::{Deserialize, Serialize};

use dockwright_shared::constants::server;

use crate::images::manifest::ExecConfig;

use super::config::ServerConfig;

/// The single foreground invocation recorded as the image `Cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StartupCommand {
    /// `<program> run <entry> [--server.fileWatcherType=none] [extra...]`
    pub fn run_module(
        program: &str,
        entry_module: &str,
        disable_file_watch: bool,
        extra_args: &[String],
    ) -> Self {
        let mut args = vec![server::RUN_SUBCOMMAND.to_string(), entry_module.to_string()];
        if disable_file_watch {
            args.push(server::DISABLE_FILE_WATCH_FLAG.to_string());
        }
        args.extend(extra_args.iter().cloned());

        Self {
            program: program.to_string(),
            args,
        }
    }

    /// Recover a command from an image `Cmd` array.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// The command an image starts with: its `Entrypoint` followed by `Cmd`.
    pub fn from_image_config(config: &ExecConfig) -> Option<Self> {
        let argv: Vec<String> = config
            .entrypoint
            .iter()
            .chain(&config.cmd)
            .cloned()
            .collect();
        Self::from_argv(&argv)
    }

    /// Program followed by its arguments, as stored in the image config.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Entry module argument following the run subcommand, if present.
    pub fn entry_module(&self) -> Option<&str> {
        match self.args.as_slice() {
            [sub, entry, ..] if sub == server::RUN_SUBCOMMAND => Some(entry.as_str()),
            _ => None,
        }
    }

    /// Arguments with the server configuration appended as flags.
    pub fn args_with_server(&self, config: &ServerConfig) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(config.server_args());
        args
    }
}

impl fmt::Display for StartupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape() {
        let cmd = StartupCommand::run_module("streamlit", "streamlit_app.py", true, &[]);
        assert_eq!(
            cmd.argv(),
            vec![
                "streamlit",
                "run",
                "streamlit_app.py",
                "--server.fileWatcherType=none"
            ]
        );
        assert_eq!(cmd.entry_module(), Some("streamlit_app.py"));
    }

    #[test]
    fn test_file_watch_flag_optional() {
        let cmd = StartupCommand::run_module("streamlit", "app.py", false, &["--theme.base=dark".into()]);
        assert_eq!(cmd.to_string(), "streamlit run app.py --theme.base=dark");
    }

    #[test]
    fn test_argv_round_trip_and_server_flags() {
        let cmd = StartupCommand::run_module("streamlit", "app.py", true, &[]);
        let restored = StartupCommand::from_argv(&cmd.argv()).unwrap();
        assert_eq!(restored, cmd);
        assert!(StartupCommand::from_argv(&[]).is_none());

        let exec = ExecConfig {
            entrypoint: vec!["tini".into(), "--".into()],
            cmd: cmd.argv(),
            ..Default::default()
        };
        let from_image = StartupCommand::from_image_config(&exec).unwrap();
        assert_eq!(from_image.program, "tini");
        assert_eq!(from_image.entry_module(), None);
        assert!(StartupCommand::from_image_config(&ExecConfig::default()).is_none());

        let args = cmd.args_with_server(&ServerConfig::default());
        assert_eq!(args.last().unwrap(), "--server.headless=true");
        assert!(args.contains(&"--server.address=0.0.0.0".to_string()));
    }
}
