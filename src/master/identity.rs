//! Process identities for masters and workers

use std::net::{IpAddr, Ipv4Addr};

use super::error::{MasterError, Result};

/// `master-<id>-<ipv4><address>`
///
/// `address` is the advertised API address, normally `:<port>`, so the
/// last segment reads as a reachable `ip:port`.
pub fn master_id(id: &str, ipv4: Ipv4Addr, address: &str) -> String {
    format!("master-{id}-{ipv4}{address}")
}

/// Reachable address embedded in a master identity
pub fn leader_address(master_id: &str) -> Option<String> {
    let rest = master_id.strip_prefix("master-")?;
    let (_, address) = rest.rsplit_once('-')?;
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

/// `<service_name>-<id>`
pub fn worker_id(service_name: &str, id: &str) -> String {
    format!("{service_name}-{id}")
}

/// First non-loopback IPv4 address of this host's interfaces
pub fn local_ipv4() -> Result<Ipv4Addr> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| MasterError::LocalAddress(e.to_string()))?;
    first_ipv4(interfaces.iter().map(|iface| iface.ip()))
        .ok_or_else(|| MasterError::LocalAddress("no non-loopback IPv4 address".to_string()))
}

/// First usable IPv4 address; link-local addresses only as a last resort
fn first_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    let mut link_local = None;
    for addr in addrs {
        let IpAddr::V4(ip) = addr else {
            continue;
        };
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        if ip.is_link_local() {
            link_local.get_or_insert(ip);
            continue;
        }
        return Some(ip);
    }
    link_local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_id_round_trip() {
        let id = master_id("1", Ipv4Addr::new(192, 168, 0, 10), ":8081");
        assert_eq!(id, "master-1-192.168.0.10:8081");
        assert_eq!(leader_address(&id).as_deref(), Some("192.168.0.10:8081"));
    }

    #[test]
    fn test_leader_address_with_dashed_short_id() {
        let id = master_id("eu-west", Ipv4Addr::new(10, 0, 0, 1), ":9000");
        assert_eq!(leader_address(&id).as_deref(), Some("10.0.0.1:9000"));
    }

    #[test]
    fn test_leader_address_rejects_foreign_values() {
        assert_eq!(leader_address("worker-1"), None);
        assert_eq!(leader_address("master-1-"), None);
    }

    #[test]
    fn test_first_ipv4_skips_loopback_and_v6() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "fe80::1".parse().unwrap(),
            IpAddr::V4(Ipv4Addr::new(169, 254, 3, 4)),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7)),
        ];
        assert_eq!(first_ipv4(addrs), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_first_ipv4_falls_back_to_link_local() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(169, 254, 3, 4)),
        ];
        assert_eq!(first_ipv4(addrs), Some(Ipv4Addr::new(169, 254, 3, 4)));
        assert_eq!(first_ipv4([IpAddr::V4(Ipv4Addr::LOCALHOST)]), None);
    }

    #[test]
    fn test_worker_id() {
        assert_eq!(worker_id("go.micro.server.worker", "1"), "go.micro.server.worker-1");
    }
}
