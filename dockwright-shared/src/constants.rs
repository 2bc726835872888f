//! Shared constants for the builder and the launcher
//!
//! These values must agree between the image that is built and the process
//! that is started from it.

/// Application server defaults
pub mod server {
    /// Default listen port (Streamlit's conventional port)
    pub const DEFAULT_PORT: u16 = 8501;

    /// Default listen address; wildcard so the server is reachable from
    /// outside the container's network namespace
    pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

    /// Headless mode is on by default for unattended execution
    pub const DEFAULT_HEADLESS: bool = true;

    /// Program that serves the dashboard
    pub const PROGRAM: &str = "streamlit";

    /// Subcommand that runs an entry module
    pub const RUN_SUBCOMMAND: &str = "run";

    /// Flag disabling the file watcher
    pub const DISABLE_FILE_WATCH_FLAG: &str = "--server.fileWatcherType=none";
}

/// Environment variable names
pub mod envs {
    /// Suppresses interactive prompts at startup
    pub const SERVER_HEADLESS: &str = "STREAMLIT_SERVER_HEADLESS";

    /// TCP port the server binds
    pub const SERVER_PORT: &str = "STREAMLIT_SERVER_PORT";

    /// Interface the server binds
    pub const SERVER_ADDRESS: &str = "STREAMLIT_SERVER_ADDRESS";

    /// Store location override
    pub const DOCKWRIGHT_HOME: &str = "DOCKWRIGHT_HOME";

    /// Application settings the dashboard reads at startup
    pub const APP_EXPECTED: &[&str] = &["API_BASE", "API_TOKEN"];
}

/// Recipe defaults, equal to the packaged dashboard's original build recipe
pub mod recipe {
    /// Pinned slim base runtime
    pub const BASE_IMAGE: &str = "python:3.11.9-slim";

    /// Working directory inside the image
    pub const WORKDIR: &str = "/app";

    /// Dependency manifest file name
    pub const MANIFEST: &str = "requirements.txt";

    /// Dependency installation command
    pub const INSTALL_COMMAND: &str = "pip install --no-cache-dir -r requirements.txt";

    /// Application entry module
    pub const ENTRY_MODULE: &str = "streamlit_app.py";

    /// Recipe file looked up in the build context
    pub const RECIPE_FILE: &str = "dockwright.yaml";

    /// Paths never copied into the payload layer
    pub const DEFAULT_EXCLUDES: &[&str] = &[".git", "__pycache__", ".venv", "dockwright.yaml"];
}

/// OCI media types
pub mod media_types {
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
}
