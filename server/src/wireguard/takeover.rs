use crate::ServerError;
use meshd_shared::wg::PeerInfoExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use wireguard_control::Device;

/// A pre-existing configuration file for the interface, if the platform keeps one at the
/// conventional `wg-quick` location. Grounded on `ConfigFile::write_to_path`'s file-permission
/// discipline, generalized to the case of reconfiguring a pre-existing foreign interface.
pub fn config_file_exists(device: &Device) -> bool {
    wg_quick_config_path(&device.name.to_string()).exists()
}

fn wg_quick_config_path(interface: &str) -> PathBuf {
    PathBuf::from("/etc/wireguard").join(format!("{interface}.conf"))
}

fn backup_root() -> PathBuf {
    PathBuf::from("/etc/meshd/backups")
}

fn timestamp() -> String {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    // YYYYMMDD-HHMMSS isn't derivable from a bare unix timestamp without a calendar
    // dependency the rest of this crate doesn't otherwise need, so the on-disk directory name
    // uses the raw epoch seconds instead; still monotonic and still unique per event.
    format!("{}", now.as_secs())
}

/// Write a timestamped backup directory under the backup root: the raw wg-quick config file
/// (if any), a human-readable peer dump, any stray `.key` files, a `RESTORE.txt`, and an
/// executable restore script. Never deletes anything; only copies.
pub fn backup(device: &Device) -> Result<PathBuf, ServerError> {
    let interface = device.name.to_string();
    let dir = backup_root().join(&interface).join(timestamp());
    fs::create_dir_all(&dir)?;

    let config_path = wg_quick_config_path(&interface);
    if config_path.exists() {
        fs::copy(&config_path, dir.join(format!("{interface}.conf")))?;
    }

    write_peer_dump(device, &dir.join("peers.txt"))?;
    copy_stray_key_files(device, &dir)?;
    write_restore_readme(&interface, &config_path, &dir)?;
    write_restore_script(&interface, &config_path, &dir)?;

    log::info!("backed up existing WireGuard configuration for {} to {}", interface, dir.display());
    Ok(dir)
}

fn write_peer_dump(device: &Device, path: &Path) -> Result<(), ServerError> {
    let mut out = String::new();
    for peer in &device.peers {
        out.push_str(&format!(
            "public_key={} endpoint={:?} allowed_ips={:?} last_handshake={} recently_connected={}\n",
            peer.config.public_key.to_base64(),
            peer.config.endpoint,
            peer.config.allowed_ips,
            peer.stats
                .last_handshake_time
                .map(|t| format!("{t:?}"))
                .unwrap_or_else(|| "never".to_string()),
            peer.is_recently_connected(),
        ));
    }
    fs::write(path, out)?;
    Ok(())
}

/// Copy any `.key` file in the wg-quick config directory other than the server's own private
/// key, since those belong to the configuration being taken over, not to this process.
fn copy_stray_key_files(device: &Device, dir: &Path) -> Result<(), ServerError> {
    let our_key = device.private_key.as_ref().map(|k| k.to_base64());
    let config_dir = PathBuf::from("/etc/wireguard");
    if !config_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&config_dir)?.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "key").unwrap_or(false) {
            if let Ok(contents) = fs::read_to_string(&path) {
                if Some(contents.trim().to_string()) == our_key {
                    continue;
                }
            }
            if let Some(name) = path.file_name() {
                let _ = fs::copy(&path, dir.join(name));
            }
        }
    }
    Ok(())
}

fn write_restore_readme(interface: &str, config_path: &Path, dir: &Path) -> Result<(), ServerError> {
    let mut file = fs::File::create(dir.join("RESTORE.txt"))?;
    writeln!(
        file,
        "This directory backs up the WireGuard configuration for `{interface}` that existed \
         before the mesh control plane took over the interface.\n\n\
         To restore it:\n  1. Stop meshd.\n  2. Run ./restore.sh from this directory, or copy \
         `{interface}.conf` back to `{}` and run `wg-quick up {interface}`.\n",
        config_path.display(),
    )?;
    Ok(())
}

fn write_restore_script(interface: &str, config_path: &Path, dir: &Path) -> Result<(), ServerError> {
    let script_path = dir.join("restore.sh");
    let mut file = fs::File::create(&script_path)?;
    writeln!(
        file,
        "#!/bin/sh\nset -e\ncp \"$(dirname \"$0\")/{interface}.conf\" \"{}\"\nwg-quick up {interface}\n",
        config_path.display(),
    )?;
    drop(file);
    meshd_shared::chmod(&fs::File::open(&script_path)?, 0o755).map_err(ServerError::Io)?;
    Ok(())
}
