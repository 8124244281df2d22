use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// All `/size` subnets contained in `base`, in strictly increasing numeric order. Empty if
/// `size` is not at least as specific as `base`'s own prefix.
pub fn enumerate_subnets(base: Ipv4Net, size: u8) -> impl Iterator<Item = Ipv4Net> {
    base.subnets(size).into_iter().flatten()
}

pub fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || a.contains(&b.broadcast()) || b.contains(&a.network()) || b.contains(&a.broadcast())
}

/// Usable host addresses within `subnet`, excluding the network and broadcast addresses for
/// any prefix shorter than /31, in strictly increasing numeric order.
pub fn host_addresses(subnet: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let network = subnet.network();
    let broadcast = subnet.broadcast();
    let exclude_ends = subnet.prefix_len() < 31;
    subnet.hosts().filter(move |ip| !exclude_ends || (*ip != network && *ip != broadcast))
}

/// Smallest usable host address in `subnet` not present in `already_used`.
pub fn next_ip(subnet: Ipv4Net, already_used: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    host_addresses(subnet).find(|ip| !already_used.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_subnets_in_order() {
        let base: Ipv4Net = "10.100.0.0/24".parse().unwrap();
        let subnets: Vec<_> = enumerate_subnets(base, 29).take(3).collect();
        assert_eq!(subnets[0].to_string(), "10.100.0.0/29");
        assert_eq!(subnets[1].to_string(), "10.100.0.8/29");
        assert_eq!(subnets[2].to_string(), "10.100.0.16/29");
    }

    #[test]
    fn overlap_detection() {
        let a: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let b: Ipv4Net = "10.100.0.4/30".parse().unwrap();
        let c: Ipv4Net = "10.100.0.8/29".parse().unwrap();
        assert!(overlaps(a, b));
        assert!(!overlaps(a, c));
    }

    #[test]
    fn next_ip_skips_used_addresses() {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let used = vec!["10.100.0.1".parse().unwrap(), "10.100.0.2".parse().unwrap()];
        assert_eq!(next_ip(subnet, &used), Some("10.100.0.3".parse().unwrap()));
    }

    #[test]
    fn next_ip_excludes_network_and_broadcast() {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let hosts: Vec<_> = host_addresses(subnet).collect();
        assert!(!hosts.contains(&"10.100.0.0".parse().unwrap()));
        assert!(!hosts.contains(&"10.100.0.7".parse().unwrap()));
    }
}
