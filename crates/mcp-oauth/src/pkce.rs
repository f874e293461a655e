use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// 32 random bytes, base64url encoded without padding (43 characters)
pub fn generate_code_verifier() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// code_challenge = BASE64URL-ENCODE(SHA256(ASCII(code_verifier)))
pub fn generate_code_challenge(code_verifier: &str) -> String {
    let hash = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random, unguessable value for the `state` parameter
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
