//! Configuration management for the libvirt agent.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use limiquantix_common::LogFormat;
use limiquantix_hypervisor::xml::DEFAULT_VOLUME_ROOT;
use limiquantix_hypervisor::{ManagerOptions, RenderOptions, DEFAULT_GUEST_TYPE, DEFAULT_MAX_CONNECTIONS};

use crate::cli::Args;

/// Location tried when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/limiquantix/libvirtd.yaml";

/// Where the running configuration came from.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No usable file. Carries the load error if the default file exists but
    /// could not be read or parsed.
    Defaults(Option<anyhow::Error>),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON-RPC server configuration
    pub server: ServerConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Load `args.config` if given, else `default_path` if it loads, else
    /// defaults. CLI overrides apply in every case. Only an explicit path
    /// must load.
    pub fn resolve(args: &Args, default_path: &Path) -> Result<(Self, ConfigSource)> {
        if let Some(ref path) = args.config {
            let config = Self::load(path)?.with_cli_overrides(args)?;
            return Ok((config, ConfigSource::File(PathBuf::from(path))));
        }

        match Self::load(default_path) {
            Ok(config) => Ok((
                config.with_cli_overrides(args)?,
                ConfigSource::File(default_path.to_path_buf()),
            )),
            Err(e) => {
                let error = default_path.exists().then_some(e);
                Ok((Self::default_with_cli(args)?, ConfigSource::Defaults(error)))
            }
        }
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Result<Self> {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(port) = args.port {
            let host = self
                .server
                .listen_address
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.listen_address = format!("{}:{}", host, port);
        }

        if let Some(ref uri) = args.uri {
            self.hypervisor.uri = uri.clone();
        }

        if let Some(max) = args.max_connections {
            self.hypervisor.max_connections = max;
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.parse()?;
        }

        Ok(self)
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor.max_connections == 0 {
            bail!("hypervisor.max_connections must be at least 1");
        }

        self.listen_addr()?;

        if self.hypervisor.uri.is_empty() {
            bail!("hypervisor.uri must not be empty");
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_address))
    }

    /// Lifecycle manager settings derived from the hypervisor section.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            default_guest_type: self.hypervisor.default_guest_type.clone(),
            render: RenderOptions {
                volume_root: self.hypervisor.volume_root.clone(),
            },
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for JSON-RPC
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:19999".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub uri: String,
    /// Connection pool size
    pub max_connections: usize,
    /// Domain type for guests that do not name one
    pub default_guest_type: String,
    /// Directory that bare disk volume names resolve under
    pub volume_root: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::default(),
            uri: "qemu:///system".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_guest_type: DEFAULT_GUEST_TYPE.to_string(),
            volume_root: DEFAULT_VOLUME_ROOT.to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Mock backend for testing/development
    Mock,
    /// Libvirt/QEMU backend
    Libvirt,
}

impl Default for HypervisorBackend {
    fn default() -> Self {
        if cfg!(feature = "libvirt") {
            Self::Libvirt
        } else {
            Self::Mock
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address, "0.0.0.0:19999");
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert_eq!(config.hypervisor.max_connections, 4);
        assert_eq!(config.hypervisor.default_guest_type, "kvm");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = Config::from_yaml(
            r#"
server:
  listen_address: "127.0.0.1:20001"
hypervisor:
  backend: mock
  max_connections: 2
  volume_root: /dev/zvol/tank/guests
logging:
  format: json
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen_address, "127.0.0.1:20001");
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.max_connections, 2);
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.manager_options().render.volume_root, "/dev/zvol/tank/guests");
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args {
            port: Some(20002),
            max_connections: Some(9),
            dev: true,
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        let config = Config::default().with_cli_overrides(&args).unwrap();
        assert_eq!(config.server.listen_address, "0.0.0.0:20002");
        assert_eq!(config.hypervisor.max_connections, 9);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.hypervisor.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.listen_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_sources() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        let broken = dir.path().join("broken.yaml");
        let good = dir.path().join("good.yaml");
        std::fs::write(&broken, "hypervisor:\n  max_connections: lots\n").unwrap();
        std::fs::write(&good, "hypervisor:\n  max_connections: 7\n").unwrap();
        let args = Args::default();

        let (config, source) = Config::resolve(&args, &missing).unwrap();
        assert!(matches!(source, ConfigSource::Defaults(None)));
        assert_eq!(config.hypervisor.max_connections, 4);

        let (config, source) = Config::resolve(&args, &broken).unwrap();
        assert!(matches!(source, ConfigSource::Defaults(Some(_))));
        assert_eq!(config.hypervisor.max_connections, 4);

        let (config, source) = Config::resolve(&args, &good).unwrap();
        assert!(matches!(source, ConfigSource::File(ref p) if p == &good));
        assert_eq!(config.hypervisor.max_connections, 7);

        let explicit = Args {
            config: Some(broken.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert!(Config::resolve(&explicit, &good).is_err());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::from_yaml("hypervisor:\n  backend: xen\n").is_err());
    }
}
