use crate::ServerError;
use ipnet::Ipv4Net;
use wireguard_control::InterfaceName;

/// Shell out to `bin args...`, logging like `shared::wg`'s macOS `cmd()` helper does, and
/// surface a non-zero exit as a `WireGuard` error (these commands are all part of bringing the
/// interface up, not WireGuard itself, but they share its failure mode from the caller's
/// perspective).
fn cmd(bin: &str, args: &[&str]) -> Result<std::process::Output, ServerError> {
    let output = std::process::Command::new(bin).args(args).output().map_err(ServerError::Io)?;
    log::debug!("cmd: {} {}", bin, args.join(" "));
    log::trace!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    log::trace!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    Ok(output)
}

fn cmd_ok(bin: &str, args: &[&str]) -> Result<bool, ServerError> {
    Ok(cmd(bin, args)?.status.success())
}

/// Parse `ip route show default` for the interface the default route points through.
#[cfg(target_os = "linux")]
fn default_egress_interface() -> Result<String, ServerError> {
    let output = cmd("ip", &["route", "show", "default"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|w| w[0] == "dev")
        .map(|w| w[1].to_string())
        .ok_or_else(|| ServerError::WireGuard)
}

#[cfg(target_os = "linux")]
fn masquerade_installed(cidr: &str, egress: &str) -> Result<bool, ServerError> {
    cmd_ok("iptables", &["-t", "nat", "-C", "POSTROUTING", "-s", cidr, "-o", egress, "-j", "MASQUERADE"])
}

#[cfg(target_os = "linux")]
fn forward_installed(interface: &str, args: &[&str]) -> Result<bool, ServerError> {
    let mut check = vec!["-C"];
    check.extend_from_slice(args);
    let _ = interface;
    cmd_ok("iptables", &check)
}

/// Install NAT `MASQUERADE` for traffic leaving `base_network` over the default egress
/// interface, and bidirectional `FORWARD ACCEPT` for the mesh interface, both idempotently
/// (check presence with `-C` before `-A`). Grounded on `shared::wg`'s "shell out, check exit
/// status, log at debug/trace" discipline, generalized from `ifconfig`/`route` to
/// `iptables`/`ip route`.
#[cfg(target_os = "linux")]
pub fn install(interface: &InterfaceName, base_network: Ipv4Net) -> Result<(), ServerError> {
    let cidr = base_network.to_string();
    let iface = interface.to_string();
    let egress = default_egress_interface()?;

    if !masquerade_installed(&cidr, &egress)? {
        cmd("iptables", &["-t", "nat", "-A", "POSTROUTING", "-s", &cidr, "-o", &egress, "-j", "MASQUERADE"])?;
    }

    let forward_in = ["FORWARD", "-i", iface.as_str(), "-o", egress.as_str(), "-j", "ACCEPT"];
    if !forward_installed(&iface, &forward_in)? {
        let mut args = vec!["-A"];
        args.extend_from_slice(&forward_in);
        cmd("iptables", &args)?;
    }

    let forward_out = ["FORWARD", "-i", egress.as_str(), "-o", iface.as_str(), "-j", "ACCEPT"];
    if !forward_installed(&iface, &forward_out)? {
        let mut args = vec!["-A"];
        args.extend_from_slice(&forward_out);
        cmd("iptables", &args)?;
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install(_interface: &InterfaceName, _base_network: Ipv4Net) -> Result<(), ServerError> {
    log::warn!("NAT/FORWARD installation is only implemented on Linux; skipping");
    Ok(())
}
