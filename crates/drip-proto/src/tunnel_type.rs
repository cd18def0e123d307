//! Tunnel protocol types.

use serde::{Deserialize, Serialize};

/// The protocol a tunnel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// HTTP requests, decoded and correlated per request.
    Http,
    /// TLS passthrough routed by SNI; bytes are opaque to the server.
    Https,
    /// Raw TCP streams on a server-allocated public port.
    Tcp,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Https => "https",
            TunnelType::Tcp => "tcp",
        }
    }

    /// Whether Data frames on this tunnel carry raw stream frames rather
    /// than JSON request/response envelopes.
    pub fn is_stream(&self) -> bool {
        matches!(self, TunnelType::Https | TunnelType::Tcp)
    }
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TunnelType::Http),
            "https" => Ok(TunnelType::Https),
            "tcp" => Ok(TunnelType::Tcp),
            other => Err(format!("unknown tunnel type: {other}")),
        }
    }
}
