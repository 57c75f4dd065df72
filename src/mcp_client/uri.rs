//! Resource URI routing.
//!
//! Resource URIs have the form `scheme://server/path`. The host component
//! names the server that owns the resource; anything that does not parse that
//! way is refused rather than guessed at.

use url::Url;

use super::errors::McpError;

/// A resource URI split into its routing parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub scheme: String,
    pub server: String,
    pub path: String,
    raw: String,
}

impl ResourceUri {
    /// Parse `raw`, requiring a scheme and a non-empty host.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        let invalid = |reason: &str| McpError::InvalidResourceUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        let server = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(invalid("missing server name in host position")),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            server,
            path: url.path().to_string(),
            raw: raw.to_string(),
        })
    }

    /// The URI exactly as the caller gave it. This is what goes on the wire.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
