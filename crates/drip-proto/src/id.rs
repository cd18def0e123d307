//! Request and stream identifier generation.

use rand::RngCore;

/// Request IDs are 16 random bytes, hex-encoded to 32 characters.
pub const REQUEST_ID_LEN: usize = 32;

/// Generate a random request/stream identifier from the OS RNG.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
