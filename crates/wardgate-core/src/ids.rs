use rand::RngCore;

/// 8 random bytes, hex-encoded -- used for Approval Request IDs (spec
/// 4.5: "generate ID (8 random bytes -> hex)").
pub fn request_id() -> String {
    random_hex(8)
}

/// 16 random bytes, hex-encoded -- used for the Approval Request's
/// capability token (spec 4.5: "token (16 random bytes -> hex)").
pub fn capability_token() -> String {
    random_hex(16)
}

fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
