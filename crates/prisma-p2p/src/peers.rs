use std::net::Ipv4Addr;

use prisma_core::types::VerifyKeyHex;
use prisma_crypto::hash::hash_tx;

/// Stable node identifier: hex of the first 10 bytes of SHA-256 of the
/// node's hex verify key.
pub fn node_id(verify_key_hex: &VerifyKeyHex) -> String {
    let digest = hash_tx(verify_key_hex.as_bytes());
    hex::encode(&digest[..10])
}

/// Accept only public IPv4 peers. Private and loopback ranges are allowed
/// in developer mode so local clusters can form.
pub fn is_valid_node_ip(ip: &str, developer_mode: bool) -> bool {
    // Peers that resolve to IPv6 or garbage are not gossiped onwards.
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    let local = addr.is_private() || addr.is_loopback() || addr.is_unspecified();
    !local || developer_mode
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_20_hex_chars() {
        let key: VerifyKeyHex = "ab".repeat(32);
        let id = node_id(&key);
        assert_eq!(id.len(), 20);
        assert_eq!(id, node_id(&key));
        assert_ne!(id, node_id(&"cd".repeat(32)));
    }

    #[test]
    fn public_ips_accepted() {
        assert!(is_valid_node_ip("8.8.8.8", false));
        assert!(is_valid_node_ip("203.0.113.9", false));
    }

    #[test]
    fn private_ips_need_developer_mode() {
        for ip in ["10.1.2.3", "192.168.0.4", "172.16.9.1", "127.0.0.1"] {
            assert!(!is_valid_node_ip(ip, false), "{ip} must be rejected");
            assert!(is_valid_node_ip(ip, true), "{ip} must pass in dev mode");
        }
    }

    #[test]
    fn garbage_rejected() {
        assert!(!is_valid_node_ip("not-an-ip", true));
        assert!(!is_valid_node_ip("", true));
    }
}
