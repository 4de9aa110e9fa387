//! The rendered configuration bundle exchanged over the agent HTTP API.
//!
//! The coordinator's generator produces this structure; the agent fetches
//! it from `/api/agent/config/{id}` and materializes the contained texts
//! on disk. Peer entries are keyed by peer name in a `BTreeMap` so two
//! renderings over the same fleet snapshot serialize byte-identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub id: i64,
    pub name: String,
    pub ipv4: String,
    pub ipv6: String,
    pub public_key: String,
    /// One WireGuard config text per peer, keyed by peer name.
    pub wireguard: BTreeMap<String, String>,
    /// The babeld config text. Interface lines carry a `{WGPrefix}` marker
    /// the agent substitutes with its local interface prefix.
    pub babel: String,
    pub mtu: u32,
    pub base_port: u16,
    pub link_local_net: String,
    pub babel_port: u16,
    /// babeld update interval in milliseconds.
    pub babel_interval: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_roundtrips_through_json() {
        let mut wireguard = BTreeMap::new();
        wireguard.insert("edge-b".to_string(), "[Interface]\n".to_string());

        let bundle = ConfigBundle {
            id: 1,
            name: "edge-a".into(),
            ipv4: "10.42.1.0/32".into(),
            ipv6: "2a13:a5c7:21ff:1::/80".into(),
            public_key: "pk".into(),
            wireguard,
            babel: "local-port 6696\n".into(),
            mtu: 1420,
            base_port: 36420,
            link_local_net: "fe80::/64".into(),
            babel_port: 6696,
            babel_interval: 5000,
        };

        let json = serde_json::to_string(&bundle).unwrap();
        let back: ConfigBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn peer_map_serializes_in_name_order() {
        let mut wireguard = BTreeMap::new();
        wireguard.insert("zeta".to_string(), "z".to_string());
        wireguard.insert("alpha".to_string(), "a".to_string());

        let bundle = ConfigBundle {
            id: 1,
            name: "n".into(),
            ipv4: String::new(),
            ipv6: String::new(),
            public_key: String::new(),
            wireguard,
            babel: String::new(),
            mtu: 1420,
            base_port: 36420,
            link_local_net: String::new(),
            babel_port: 6696,
            babel_interval: 5000,
        };

        let json = serde_json::to_string(&bundle).unwrap();
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
    }
}
