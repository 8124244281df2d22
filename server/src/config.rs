use ipnet::Ipv4Net;
use meshd_shared::Endpoint;
use std::{env, net::IpAddr, path::PathBuf};

/// Paths the server reads and writes under. Built once at construction and threaded through
/// every component instead of re-read at call sites.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ServerConfig {
    pub fn new(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self { config_dir, data_dir }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("meshd.db")
    }

    pub fn wg_private_key_path(&self) -> PathBuf {
        self.config_dir.join("server.key")
    }

    pub fn wg_public_key_path(&self) -> PathBuf {
        self.config_dir.join("server.pub")
    }

    pub fn ssh_host_key_path(&self) -> PathBuf {
        self.config_dir.join("broker_host_key")
    }

    /// Pre-1.0 deployments stored the host key alongside the binary; migrated forward on load.
    pub fn legacy_ssh_host_key_path(&self) -> PathBuf {
        PathBuf::from("/etc/meshd/host_key")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.config_dir.join("backups")
    }
}

/// Environment-derived configuration for the allocation, WireGuard, tunnel, and auth
/// subsystems. Everything here is read once in `MeshConfig::from_env` at process start.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub base_network: Ipv4Net,
    pub subnet_size: u8,
    pub fallback_networks: Vec<Ipv4Net>,
    pub interface: String,
    pub server_public_endpoint: Endpoint,
    pub tunnel_port_start: u16,
    pub tunnel_port_end: u16,
    pub api_host: IpAddr,
    pub api_port: u16,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub max_devices_per_user: u32,
    pub admin_emails: Vec<String>,
    pub database_url: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {0}: {1}")]
    Invalid(&'static str, String),
}

fn env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(name, v)),
        Err(_) => Ok(default),
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

impl MeshConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_network = env_or("WG_BASE_NETWORK", "10.100.0.0/16".parse::<Ipv4Net>().unwrap())?;
        let subnet_size: u8 = env_or("WG_SUBNET_SIZE", 29)?;

        let fallback_networks = match env::var("WG_FALLBACK_NETWORKS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<Ipv4Net>()
                        .map_err(|_| ConfigError::Invalid("WG_FALLBACK_NETWORKS", s.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };

        let interface = env::var("WG_INTERFACE").unwrap_or_else(|_| "wg0".to_string());

        let server_public_endpoint: Endpoint = required("WG_SERVER_PUBLIC_ENDPOINT")?
            .parse()
            .map_err(|_| ConfigError::Invalid("WG_SERVER_PUBLIC_ENDPOINT", "unparseable host:port".into()))?;

        let tunnel_port_start = env_or("TUNNEL_PORT_START", 10000u16)?;
        let tunnel_port_end = env_or("TUNNEL_PORT_END", 20000u16)?;

        let api_host = env_or("API_HOST", "0.0.0.0".parse::<IpAddr>().unwrap())?;
        let api_port = env_or("API_PORT", 8080u16)?;

        let jwt_secret = required("JWT_SECRET")?;
        let jwt_expiration_secs = env_or("JWT_EXPIRATION", 3600u64)?;

        let max_devices_per_user = env_or("MAX_DEVICES_PER_USER", 5u32)?;

        let admin_emails = env::var("ADMIN_EMAILS")
            .map(|raw| raw.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let database_url = env::var("DATABASE_URL").ok();

        Ok(Self {
            base_network,
            subnet_size,
            fallback_networks,
            interface,
            server_public_endpoint,
            tunnel_port_start,
            tunnel_port_end,
            api_host,
            api_port,
            jwt_secret,
            jwt_expiration_secs,
            max_devices_per_user,
            admin_emails,
            database_url,
        })
    }
}
