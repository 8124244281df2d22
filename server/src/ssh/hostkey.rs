use crate::config::ServerConfig;
use crate::ServerError;
use meshd_shared::chmod;
use ssh_key::{rand_core::OsRng, HashAlg, LineEnding, PrivateKey};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

const HOST_KEY_BITS: usize = 2048;

/// Load the broker's RSA host key, generating one on first start. Pre-1.0 deployments kept the
/// key at `legacy_ssh_host_key_path`; if that's the only copy found, it's migrated to the
/// current path rather than regenerated, so already-trusted fingerprints survive the upgrade.
pub fn load_or_generate(config: &ServerConfig) -> Result<PrivateKey, ServerError> {
    let path = config.ssh_host_key_path();
    let legacy = config.legacy_ssh_host_key_path();

    if !path.exists() && legacy.exists() {
        log::info!("migrating SSH host key from legacy path {} to {}", legacy.display(), path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&legacy, &path)?;
    }

    if path.exists() {
        match std::fs::read_to_string(&path).ok().and_then(|raw| PrivateKey::from_openssh(&raw).ok()) {
            Some(key) => {
                log::info!("loaded SSH host key, fingerprint {}", key.public_key().fingerprint(HashAlg::Sha256));
                return Ok(key);
            },
            None => {
                log::warn!("SSH host key at {} is unreadable or corrupt; backing it up and generating a new one", path.display());
                backup_unreadable_key(config, &path)?;
            },
        }
    }

    generate_and_persist(&path)
}

fn generate_and_persist(path: &Path) -> Result<PrivateKey, ServerError> {
    log::info!("generating new {}-bit RSA SSH host key", HOST_KEY_BITS);
    let keypair = ssh_key::private::RsaKeypair::random(&mut OsRng, HOST_KEY_BITS)
        .map_err(|_| ServerError::Validation("failed to generate RSA host key".into()))?;
    let key = PrivateKey::new(ssh_key::private::KeypairData::Rsa(keypair), "meshd broker host key")
        .map_err(|_| ServerError::Validation("failed to assemble RSA host key".into()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let openssh = key.to_openssh(LineEnding::LF).map_err(|_| ServerError::Validation("failed to encode host key".into()))?;
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    chmod(&file, 0o600).map_err(ServerError::Io)?;
    file.write_all(openssh.as_bytes())?;

    log::info!("generated SSH host key, fingerprint {}", key.public_key().fingerprint(HashAlg::Sha256));
    Ok(key)
}

fn backup_unreadable_key(config: &ServerConfig, path: &Path) -> Result<(), ServerError> {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
    let dir = config.backup_dir().join("ssh_host_key").join(now.to_string());
    std::fs::create_dir_all(&dir)?;
    std::fs::copy(path, dir.join("broker_host_key"))?;
    std::fs::write(
        dir.join("RESTORE.txt"),
        "This directory backs up a broker SSH host key that meshd could not parse on startup \
         and therefore replaced. If this was a mistake, stop meshd, copy `broker_host_key` back \
         to its original location, and restart.\n",
    )?;
    Ok(())
}
