//! SNI extraction from a raw TLS ClientHello.
//!
//! `https` tunnels are routed without terminating TLS: the passthrough
//! listener peeks the ClientHello, pulls the server name out of it, and
//! relays the untouched bytes over the matching control link.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("client hello truncated")]
    Truncated,

    #[error("no server_name extension")]
    Missing,

    #[error("malformed server_name extension")]
    Malformed,
}

/// Extract the SNI hostname from the first TLS record of a connection.
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    // Record header (5) + handshake header (4) + version (2) + random (32).
    if client_hello.len() < 43 {
        return Err(SniError::Truncated);
    }
    let mut offset = 9 + 2 + 32;

    // Session id.
    let session_id_len = *client_hello.get(offset).ok_or(SniError::Truncated)? as usize;
    offset += 1 + session_id_len;

    // Cipher suites.
    let suites_len = read_u16(client_hello, offset).ok_or(SniError::Truncated)? as usize;
    offset += 2 + suites_len;

    // Compression methods.
    let compression_len = *client_hello.get(offset).ok_or(SniError::Truncated)? as usize;
    offset += 1 + compression_len;

    // Extensions block.
    let extensions_len = read_u16(client_hello, offset).ok_or(SniError::Truncated)? as usize;
    offset += 2;
    let extensions_end = offset + extensions_len;
    if extensions_end > client_hello.len() {
        return Err(SniError::Truncated);
    }

    while offset + 4 <= extensions_end {
        let ext_type = read_u16(client_hello, offset).ok_or(SniError::Truncated)?;
        let ext_len = read_u16(client_hello, offset + 2).ok_or(SniError::Truncated)? as usize;
        offset += 4;
        if offset + ext_len > extensions_end {
            return Err(SniError::Truncated);
        }
        if ext_type == 0x0000 {
            return parse_server_name(&client_hello[offset..offset + ext_len]);
        }
        offset += ext_len;
    }

    Err(SniError::Missing)
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    // server_name_list length (2), name_type (1), host_name length (2).
    if data.len() < 5 {
        return Err(SniError::Malformed);
    }
    if data[2] != 0 {
        return Err(SniError::Malformed);
    }
    let name_len = read_u16(data, 3).ok_or(SniError::Malformed)? as usize;
    let name = data.get(5..5 + name_len).ok_or(SniError::Malformed)?;
    let hostname = std::str::from_utf8(name).map_err(|_| SniError::Malformed)?;
    if hostname.is_empty() {
        return Err(SniError::Malformed);
    }
    Ok(hostname.to_string())
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
    ]))
}
