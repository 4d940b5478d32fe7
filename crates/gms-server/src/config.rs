//! Server configuration: TOML file + CLI overrides.

use gms_client::ClientMessengerFactory;
use gms_core::endpoint::EndpointConfig;
use gms_core::messages::ClientAuthMessage;
use gms_core::transport::{ClientSocketConfig, HostPointer, ServerSocketConfig};
use gms_core::{GmsError, GmsResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub client_authentication: ClientAuthenticationSection,
    #[serde(default)]
    pub process: ProcessSection,
}

/// `[server]`: the listening side.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub packet_bytes_length: usize,
    pub listening_limit_total: u32,
    pub accept_timeout_secs: f64,
    pub handshake_timeout_secs: f64,
    pub send_timeout_secs: f64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 35125,
            packet_bytes_length: 4096,
            listening_limit_total: 10,
            accept_timeout_secs: 1.0,
            handshake_timeout_secs: 5.0,
            send_timeout_secs: 10.0,
        }
    }
}

/// `[tls]`: certificate for inbound connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: "~/.gms/cert.pem".to_string(),
            key: "~/.gms/key.pem".to_string(),
        }
    }
}

/// `[client_authentication]`: the upstream authentication server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientAuthenticationSection {
    pub host: String,
    pub port: u16,
    pub packet_bytes_length: usize,
    pub connect_timeout_secs: f64,
    pub relay_timeout_secs: f64,
    /// PEM root certificate; enables TLS towards the authentication server.
    pub root_cert: Option<String>,
}

impl Default for ClientAuthenticationSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 35124,
            packet_bytes_length: 4096,
            connect_timeout_secs: 5.0,
            relay_timeout_secs: 120.0,
            root_cert: None,
        }
    }
}

/// `[process]`: heartbeat logging of the running binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSection {
    pub heartbeat_interval_secs: f64,
    pub heartbeat_log: bool,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10.0,
            heartbeat_log: false,
        }
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_host: Option<String>,
    pub auth_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: HostPointer,
    pub packet_bytes_length: usize,
    pub listening_limit_total: u32,
    pub accept_timeout: Duration,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    pub tls: Option<TlsPaths>,
    pub auth_server: HostPointer,
    pub auth_packet_bytes_length: usize,
    pub auth_connect_timeout: Duration,
    pub relay_timeout: Duration,
    pub auth_root_cert: Option<PathBuf>,
    pub heartbeat_interval: Duration,
    pub heartbeat_log: bool,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides. A missing file
    /// means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> GmsResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Apply overrides to a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> GmsResult<Self> {
        let ConfigFile {
            server,
            tls,
            client_authentication: auth,
            process,
        } = file;

        let port = overrides.port.unwrap_or(server.port);
        let auth_port = overrides.auth_port.unwrap_or(auth.port);
        if port == 0 || auth_port == 0 {
            return Err(GmsError::Config("ports must be non-zero".into()));
        }
        if server.packet_bytes_length == 0 || auth.packet_bytes_length == 0 {
            return Err(GmsError::Config(
                "packet_bytes_length must be non-zero".into(),
            ));
        }
        if server.listening_limit_total == 0 {
            return Err(GmsError::Config(
                "listening_limit_total must be non-zero".into(),
            ));
        }

        Ok(Self {
            bind: HostPointer::new(overrides.host.clone().unwrap_or(server.host), port),
            packet_bytes_length: server.packet_bytes_length,
            listening_limit_total: server.listening_limit_total,
            accept_timeout: seconds("server.accept_timeout_secs", server.accept_timeout_secs)?,
            handshake_timeout: seconds(
                "server.handshake_timeout_secs",
                server.handshake_timeout_secs,
            )?,
            send_timeout: seconds("server.send_timeout_secs", server.send_timeout_secs)?,
            tls: tls.enabled.then(|| TlsPaths {
                cert: expand_tilde_str(&tls.cert),
                key: expand_tilde_str(&tls.key),
            }),
            auth_server: HostPointer::new(overrides.auth_host.clone().unwrap_or(auth.host), auth_port),
            auth_packet_bytes_length: auth.packet_bytes_length,
            auth_connect_timeout: seconds(
                "client_authentication.connect_timeout_secs",
                auth.connect_timeout_secs,
            )?,
            relay_timeout: seconds(
                "client_authentication.relay_timeout_secs",
                auth.relay_timeout_secs,
            )?,
            auth_root_cert: auth.root_cert.as_deref().map(expand_tilde_str),
            heartbeat_interval: seconds(
                "process.heartbeat_interval_secs",
                process.heartbeat_interval_secs,
            )?,
            heartbeat_log: process.heartbeat_log,
        })
    }

    /// Listening socket settings.
    pub fn socket_config(&self, tls: Option<TlsAcceptor>) -> ServerSocketConfig {
        ServerSocketConfig {
            bind: self.bind.clone(),
            backlog: self.listening_limit_total,
            accept_timeout: self.accept_timeout,
            handshake_timeout: self.handshake_timeout,
            tls,
        }
    }

    /// Settings of every inbound client endpoint.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            max_packet_bytes: self.packet_bytes_length,
            send_timeout: Some(self.send_timeout),
        }
    }

    /// Messenger factory for the authentication server.
    pub fn auth_factory(&self, tls: Option<TlsConnector>) -> ClientMessengerFactory<ClientAuthMessage> {
        ClientMessengerFactory::new(
            self.auth_server.clone(),
            ClientSocketConfig {
                connect_timeout: self.auth_connect_timeout,
                tls,
            },
            EndpointConfig {
                max_packet_bytes: self.auth_packet_bytes_length,
                send_timeout: Some(self.send_timeout),
            },
        )
    }
}

fn parse(content: &str) -> GmsResult<ConfigFile> {
    toml::from_str(content).map_err(|e| GmsError::Config(format!("config parse error: {e}")))
}

fn seconds(field: &str, value: f64) -> GmsResult<Duration> {
    if !(value.is_finite() && value > 0.0) {
        return Err(GmsError::Config(format!(
            "{field} must be a positive number of seconds, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| GmsError::Config(format!("{field}: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
