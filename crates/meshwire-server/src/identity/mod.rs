//! Node identity: WireGuard keypairs and authentication tokens.

mod keys;
mod token;

pub use keys::{generate_keypair, Keypair};
pub use token::{generate_node_token, TokenVerifier};
