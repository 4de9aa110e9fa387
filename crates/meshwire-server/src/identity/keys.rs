//! WireGuard keypair generation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// A freshly generated X25519 keypair, Base64-encoded the way WireGuard
/// config files expect.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a WireGuard keypair.
///
/// 32 bytes of OS randomness as the private scalar (x25519-dalek applies
/// the curve clamping), public key by scalar multiplication of the
/// basepoint.
pub fn generate_keypair() -> Keypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    Keypair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}
