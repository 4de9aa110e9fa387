//! Node token generation and verification.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::storage::Store;

/// Generate a node authentication token: 32 bytes of OS randomness,
/// URL-safe Base64 without padding.
pub fn generate_node_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Verifies node tokens against the store.
///
/// A missing node and a token mismatch are indistinguishable to callers;
/// the comparison itself is constant-time.
#[derive(Clone)]
pub struct TokenVerifier {
    store: Arc<dyn Store>,
}

impl TokenVerifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn verify(&self, node_id: i64, candidate: &str) -> bool {
        let Ok(node) = self.store.get_node(node_id).await else {
            debug!(node_id, valid = false, "Validating node token");
            return false;
        };

        let valid = node.token.as_bytes().ct_eq(candidate.as_bytes()).into();
        debug!(node_id, valid, "Validating node token");
        valid
    }
}
