use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    net::{SocketAddr, ToSocketAddrs},
    ops::Deref,
    path::Path,
    str::FromStr,
};
use url::Host;

/// An external endpoint that supports both IP and domain name hosts, e.g. the value of
/// `WG_SERVER_PUBLIC_ENDPOINT` or the `server_host` returned from tunnel registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4addr) => Self { host: Host::Ipv4(*v4addr.ip()), port: v4addr.port() },
            SocketAddr::V6(v6addr) => Self { host: Host::Ipv6(*v6addr.ip()), port: v6addr.port() },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                let port = port.parse().map_err(|_| "couldn't parse port")?;
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Endpoint {
    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "failed to resolve address"))
    }
}

/// A device's display name within a user's account. Validation per spec is just "non-empty";
/// the newtype still exists so callers can't accidentally pass an unvalidated `String` through
/// the registrar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceName(String);

impl DeviceName {
    pub fn is_valid(name: &str) -> bool {
        !name.is_empty() && name.len() < 64
    }
}

impl FromStr for DeviceName {
    type Err = &'static str;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("device name must be non-empty and under 64 characters")
        }
    }
}

impl Deref for DeviceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DeviceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WireGuard base64 public keys are exactly 44 characters (32 bytes, base64-padded).
const WG_KEY_LEN: usize = 44;

pub fn validate_wg_public_key(key: &str) -> Result<(), &'static str> {
    if key.len() != WG_KEY_LEN {
        return Err("WireGuard public key must be 44 characters");
    }
    wireguard_control::Key::from_base64(key)
        .map(|_| ())
        .map_err(|_| "WireGuard public key failed to parse as base64")
}

/// Re-marshal an `authorized_keys`-format SSH public key to its canonical form, stripping any
/// comment and surrounding whitespace. Both registration and authentication call this so that
/// lookup can be an exact-string match (spec invariant 7 / design note "SSH public-key
/// normalization").
pub fn normalize_ssh_public_key(raw: &str) -> Result<String, ssh_key::Error> {
    let key = ssh_key::PublicKey::from_openssh(raw.trim())?;
    key.to_openssh().map(|s| s.trim().to_string())
}

/// Matches the requirements of hostname(7): used to validate interface names and the like.
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-zA-Z0-9]-?)*[a-zA-Z0-9]$").unwrap());

pub fn is_valid_hostname(name: &str) -> bool {
    name.len() < 64 && HOSTNAME_REGEX.is_match(name)
}

pub trait IoErrorContext<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError>;
    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError> {
        self.with_str(path.as_ref().to_string_lossy())
    }

    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError> {
        self.map_err(|e| WrappedIoError { io_error: e, context: context.into() })
    }
}

#[derive(Debug)]
pub struct WrappedIoError {
    io_error: std::io::Error,
    context: String,
}

impl Display for WrappedIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.context, self.io_error)
    }
}

impl std::error::Error for WrappedIoError {}

impl Deref for WrappedIoError {
    type Target = std::io::Error;

    fn deref(&self) -> &Self::Target {
        &self.io_error
    }
}

impl From<WrappedIoError> for std::io::Error {
    fn from(e: WrappedIoError) -> Self {
        e.io_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_roundtrip() {
        let e: Endpoint = "vpn.example.com:51820".parse().unwrap();
        assert_eq!(e.to_string(), "vpn.example.com:51820");
    }

    #[test]
    fn device_name_rejects_empty() {
        assert!("".parse::<DeviceName>().is_err());
        assert!("laptop".parse::<DeviceName>().is_ok());
    }

    #[test]
    fn wg_key_length_enforced() {
        assert!(validate_wg_public_key("short").is_err());
    }
}
