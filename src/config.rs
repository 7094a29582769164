use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listening endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public bind address (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Public listen port (default: 9080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle keep-alive connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle keep-alive connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.host, self.port, e))
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// supervisor. Protect configuration files accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Shell-style command line used to launch the backend (default: "tabby serve")
    #[serde(default = "default_command")]
    pub command: String,

    /// Extra arguments appended after the command line
    #[serde(default)]
    pub args: Vec<String>,

    /// Address the backend binds to (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port passed to the backend as `--port <port>` (default: 9081)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Idle seconds without requests before the backend is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum seconds to wait for readiness, 0 waits forever
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Connect timeout of a single readiness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Environment variables to set for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the backend
    pub working_dir: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            host: default_host(),
            port: default_backend_port(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

impl BackendConfig {
    /// Create a backend config for a command line and port with defaults
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set extra arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Split the command line into program and leading arguments
    pub fn program_and_args(&self) -> anyhow::Result<(String, Vec<String>)> {
        let mut words = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("Invalid backend command '{}': {}", self.command, e))?;
        if words.is_empty() {
            anyhow::bail!("Backend command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    /// Full argv after the program: command tail, extra args, then `--port <port>`
    pub fn argv(&self) -> anyhow::Result<(String, Vec<String>)> {
        let (program, mut args) = self.program_and_args()?;
        args.extend(self.args.iter().cloned());
        args.push("--port".to_string());
        args.push(self.port.to_string());
        Ok((program, args))
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// `None` means the readiness wait is unbounded
    pub fn startup_timeout(&self) -> Option<Duration> {
        match self.startup_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.program_and_args() {
            errors.push(e.to_string());
        }
        if self.port == 0 {
            errors.push("backend 'port' must be greater than 0".to_string());
        }
        if self.idle_timeout_secs == 0 {
            errors.push("backend 'idle_timeout_secs' must be greater than 0".to_string());
        }
        if self.probe_interval_ms == 0 {
            errors.push("backend 'probe_interval_ms' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9080
}

fn default_backend_port() -> u16 {
    9081
}

fn default_command() -> String {
    "tabby serve".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_startup_timeout() -> u64 {
    600 // model loading can be slow
}

fn default_probe_interval() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then command line overrides
    pub fn from_cli(cli: &CliArgs) -> anyhow::Result<Self> {
        let mut config = match cli.config_path {
            Some(ref path) => Config::load(path).map_err(|e| {
                anyhow::anyhow!("Failed to load configuration '{}': {}", path.display(), e)
            })?,
            None => Config::default(),
        };
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server 'port' must be greater than 0".to_string());
        }
        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }
        if let Err(mut backend_errors) = self.backend.validate() {
            errors.append(&mut backend_errors);
        }
        if self.server.host == self.backend.host && self.server.port == self.backend.port {
            errors.push(format!(
                "server and backend both use {}:{}",
                self.server.host, self.server.port
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

pub const USAGE: &str = "\
Usage: idlegate [OPTIONS] [BACKEND ARGS...]

Starts the backend on the first request and stops it after an idle period.
Unrecognised arguments (and everything after `--`) are passed to the backend.

Options:
  -p, --port <PORT>            Port to listen on (default: 9080)
      --host <HOST>            Host to bind to (default: 127.0.0.1)
      --timeout <SECS>         Idle time before the backend is shut down (default: 300)
      --backend-port <PORT>    Port for the backend (default: 9081)
      --backend-host <HOST>    Host the backend binds to (default: 127.0.0.1)
      --backend-command <CMD>  Command used to launch the backend (default: \"tabby serve\")
      --config <PATH>          Load settings from a TOML file
  -h, --help                   Print help
  -V, --version                Print version";

/// What the command line asked for
#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    Run,
    Help,
    Version,
}

/// Parsed command line. Options the supervisor does not recognise are kept,
/// in order, as pass-through arguments for the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub action: CliAction,
    pub config_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub timeout_secs: Option<u64>,
    pub backend_port: Option<u16>,
    pub backend_host: Option<String>,
    pub backend_command: Option<String>,
    pub passthrough: Vec<String>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            action: CliAction::Run,
            config_path: None,
            port: None,
            host: None,
            timeout_secs: None,
            backend_port: None,
            backend_host: None,
            backend_command: None,
            passthrough: Vec::new(),
        }
    }
}

impl CliArgs {
    /// Parse arguments, excluding the program name
    pub fn parse<I, S>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cli = CliArgs::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if arg == "--" {
                cli.passthrough.extend(args.by_ref());
                break;
            }

            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };

            let mut value = |name: &str| -> anyhow::Result<String> {
                match inline.clone() {
                    Some(v) => Ok(v),
                    None => args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", name)),
                }
            };

            match flag.as_str() {
                "-h" | "--help" => cli.action = CliAction::Help,
                "-V" | "--version" => cli.action = CliAction::Version,
                "-p" | "--port" => cli.port = Some(parse_port(&flag, &value(&flag)?)?),
                "--host" => cli.host = Some(value(&flag)?),
                "--timeout" => {
                    let raw = value(&flag)?;
                    let secs = raw
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", flag, raw))?;
                    cli.timeout_secs = Some(secs);
                }
                "--backend-port" | "--tabbyport" => {
                    cli.backend_port = Some(parse_port(&flag, &value(&flag)?)?)
                }
                "--backend-host" | "--tabbyhost" => cli.backend_host = Some(value(&flag)?),
                "--backend-command" => cli.backend_command = Some(value(&flag)?),
                "--config" => cli.config_path = Some(PathBuf::from(value(&flag)?)),
                _ => cli.passthrough.push(arg),
            }
        }

        Ok(cli)
    }

    /// Overlay command line values onto a configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.backend.idle_timeout_secs = secs;
        }
        if let Some(port) = self.backend_port {
            config.backend.port = port;
        }
        if let Some(ref host) = self.backend_host {
            config.backend.host = host.clone();
        }
        if let Some(ref command) = self.backend_command {
            config.backend.command = command.clone();
        }
        config.backend.args.extend(self.passthrough.iter().cloned());
    }
}

fn parse_port(flag: &str, raw: &str) -> anyhow::Result<u16> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("Invalid port for {}: {}", flag, raw))
}
