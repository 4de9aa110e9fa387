//! The configuration generator.
//!
//! Given a target node and the current fleet snapshot, produce one
//! WireGuard config text per peer and the babeld config text. The same
//! snapshot and settings always render byte-identically: peers are
//! iterated in id order, the peer map is a BTreeMap, and nothing in here
//! reads the clock.
//!
//! The symmetry invariant lives in the pair allocator: the listen port
//! rendered into N's config for peer P is `pair_port(N, P)`, the same
//! value P renders for N, and the endpoint each side dials carries that
//! same port.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use meshwire_core::bundle::ConfigBundle;
use meshwire_core::config::{NetworkConfig, TemplatesConfig};

use crate::error::Result;
use crate::storage::{Node, Store};

use super::templates::{format_endpoint, render_addr_v4, render_addr_v6, render_placeholders};

#[derive(Clone)]
pub struct ConfigGenerator {
    store: Arc<dyn Store>,
    network: NetworkConfig,
    templates: TemplatesConfig,
}

impl ConfigGenerator {
    pub fn new(store: Arc<dyn Store>, network: NetworkConfig, templates: TemplatesConfig) -> Self {
        Self {
            store,
            network,
            templates,
        }
    }

    /// Render the full configuration bundle for a node.
    pub async fn generate(&self, node_id: i64) -> Result<ConfigBundle> {
        let node = self.store.get_node(node_id).await?;
        let fleet = self.store.list_nodes().await?;

        let mut wireguard = BTreeMap::new();
        let mut interfaces = Vec::new();

        for peer in fleet.iter().filter(|p| p.id != node.id) {
            let port = self
                .store
                .get_or_create_pair_port(node.id, peer.id, self.network.base_port)
                .await?;

            wireguard.insert(peer.name.clone(), self.render_wireguard(&node, peer, port));
            interfaces.push(format!("interface {{WGPrefix}}{}", peer.name));
        }

        let babel = self.render_babel(&node, &interfaces);

        Ok(ConfigBundle {
            id: node.id,
            name: node.name.clone(),
            ipv4: node.ipv4.clone(),
            ipv6: node.ipv6.clone(),
            public_key: node.public_key.clone(),
            wireguard,
            babel,
            mtu: node.mtu,
            base_port: self.network.base_port,
            link_local_net: self.network.link_local_net.clone(),
            babel_port: self.network.babel_port,
            babel_interval: node.babel_interval,
        })
    }

    /// Per-node address from the node templates; used at node creation.
    pub fn node_addresses(&self, node_id: i64) -> (String, String) {
        (
            render_addr_v4(&self.network.ipv4_node_template, node_id, 0),
            render_addr_v6(&self.network.ipv6_node_template, node_id, 0),
        )
    }

    fn render_wireguard(&self, node: &Node, peer: &Node, port: u16) -> String {
        let ipv4 = render_addr_v4(&self.network.ipv4_template, node.id, peer.id);
        let ipv6 = render_addr_v6(&self.network.ipv6_template, node.id, peer.id);
        let link_local = render_addr_v4(&self.network.link_local_template, node.id, peer.id);

        // Allowed addresses are the routed subnets behind the peer, not
        // the point-to-point link addresses.
        let allowed = format!(
            "{}, {}",
            render_addr_v4(&self.network.ipv4_node_template, peer.id, 0),
            render_addr_v6(&self.network.ipv6_node_template, peer.id, 0),
        );

        let endpoint = match peer.endpoints.first() {
            Some(host) => format_endpoint(host, port),
            None => {
                // A peer without endpoints must not block the rest of
                // the mesh; emit a placeholder and keep going.
                warn!(
                    node_id = node.id,
                    peer_id = peer.id,
                    "Peer has no endpoints; rendering placeholder"
                );
                format_endpoint("0.0.0.0", port)
            }
        };

        render_placeholders(
            &self.templates.wireguard,
            &[
                ("PrivateKey", node.private_key.clone()),
                ("ListenPort", port.to_string()),
                ("IPv4Address", ipv4),
                ("IPv6Address", ipv6),
                ("LinkLocal", link_local),
                ("MTU", node.mtu.to_string()),
                ("NodeID", node.id.to_string()),
                ("Peer.PublicKey", peer.public_key.clone()),
                ("Peer.AllowedIPs", allowed),
                ("Peer.Endpoint", endpoint),
                ("Peer.ID", peer.id.to_string()),
                ("LinkLocalNet", self.network.link_local_net.clone()),
                ("BabelMulticast", self.network.babel_multicast.clone()),
            ],
        )
    }

    fn render_babel(&self, node: &Node, interfaces: &[String]) -> String {
        let ipv4_route = format!(
            "redistribute ip {} metric 128",
            render_addr_v4(&self.network.ipv4_node_template, node.id, 0)
        );
        let ipv6_route = format!(
            "redistribute ip {} metric 128",
            render_addr_v6(&self.network.ipv6_node_template, node.id, 0)
        );

        render_placeholders(
            &self.templates.babel,
            &[
                ("NodeID", node.id.to_string()),
                ("Port", self.network.babel_port.to_string()),
                ("UpdateInterval", node.babel_interval.to_string()),
                ("Interfaces", interfaces.join("\n")),
                ("IPv4Routes", ipv4_route),
                ("IPv6Routes", ipv6_route),
            ],
        )
    }
}
