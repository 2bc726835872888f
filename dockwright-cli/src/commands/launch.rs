use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use dockwright::constants::{envs, recipe as defaults, server};
use dockwright::launcher::{DEFAULT_GRACE_PERIOD, LaunchSpec, Launcher, ServerConfig, StartupCommand};

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Directory holding the application; the server's working directory
    #[arg(long, default_value = defaults::WORKDIR)]
    pub workdir: PathBuf,

    /// Entry module passed to the run subcommand
    #[arg(long, default_value = defaults::ENTRY_MODULE)]
    pub entry: String,

    /// Server program
    #[arg(long, default_value = server::PROGRAM)]
    pub program: String,

    /// Keep the server's file watcher enabled
    #[arg(long)]
    pub watch: bool,

    /// Seconds to probe the listen socket after start (0 disables the probe)
    #[arg(long, default_value_t = 0)]
    pub ready_timeout: u64,

    /// Seconds a forwarded signal is given before the server is killed
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD.as_secs())]
    pub grace_period: u64,

    /// Application settings to warn about when unset
    #[arg(long = "expect-env", value_delimiter = ',')]
    pub expect_env: Option<Vec<String>>,

    /// Extra arguments appended to the server command
    #[arg(last = true)]
    pub extra: Vec<String>,
}

impl LaunchArgs {
    fn spec(&self) -> LaunchSpec {
        LaunchSpec {
            workdir: self.workdir.clone(),
            command: StartupCommand::run_module(&self.program, &self.entry, !self.watch, &self.extra),
            expected_env: self.expect_env.clone().unwrap_or_else(|| {
                envs::APP_EXPECTED.iter().map(|s| s.to_string()).collect()
            }),
            ready_timeout: (self.ready_timeout > 0).then(|| Duration::from_secs(self.ready_timeout)),
            grace_period: Duration::from_secs(self.grace_period),
        }
    }
}

/// Runs the server in the foreground and returns its exit code.
pub async fn execute(args: LaunchArgs) -> anyhow::Result<i32> {
    let config = ServerConfig::from_env()?;
    let launcher = Launcher::new(args.spec());

    tracing::debug!(command = %launcher.spec().command, "Launching");
    let outcome = launcher.run(config).await?;
    Ok(outcome.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: LaunchArgs,
    }

    #[test]
    fn test_defaults_match_image_command() {
        let spec = Wrapper::parse_from(["launch"]).args.spec();
        assert_eq!(spec.command, LaunchSpec::default().command);
        assert_eq!(spec.expected_env, vec!["API_BASE", "API_TOKEN"]);
        assert_eq!(spec.ready_timeout, None);
        assert_eq!(spec.grace_period, DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn test_flags_shape_the_command() {
        let spec = Wrapper::parse_from([
            "launch",
            "--entry",
            "main.py",
            "--watch",
            "--expect-env",
            "DB_URL,SECRET",
            "--ready-timeout",
            "5",
            "--",
            "--theme.base=dark",
        ])
        .args
        .spec();

        assert_eq!(
            spec.command.argv(),
            vec!["streamlit", "run", "main.py", "--theme.base=dark"]
        );
        assert_eq!(spec.expected_env, vec!["DB_URL", "SECRET"]);
        assert_eq!(spec.ready_timeout, Some(Duration::from_secs(5)));
    }
}
