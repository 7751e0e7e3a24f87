//! Error types for lease negotiation.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Backing-store failures have their
//! own [`StoreError`](crate::store::StoreError) and are wrapped in
//! [`Error::StoreUnavailable`].

use std::net::Ipv4Addr;

use crate::store::StoreError;

/// Errors that can occur while negotiating or managing leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease snapshots).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A datagram could not be decoded.
    ///
    /// Raised when the buffer is shorter than the fixed header, the magic
    /// cookie is missing, or an option runs past the end of the buffer.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No free address is left and nothing could be reclaimed.
    #[error("No available addresses in pool")]
    PoolExhausted,

    /// Requested address is outside `pool_start..=pool_end`.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// Requested address is held by another client's live lease.
    #[error("Address {0} is leased to another client")]
    AddressInUse(Ipv4Addr),

    /// Client asked for an address other than the one it was offered or holds.
    #[error("Address {0} does not match the client's offer")]
    AddressNotOffered(Ipv4Addr),

    /// The lease store failed.
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., pool_start > pool_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The client gave up waiting for a reply.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The server refused the negotiation (NAK or non-2xx response).
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// True for the outcomes of `confirm` that are answered with a NAK.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AddressOutOfRange(_) | Self::AddressInUse(_) | Self::AddressNotOffered(_)
        )
    }
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(Error::AddressOutOfRange(ip).is_rejection());
        assert!(Error::AddressInUse(ip).is_rejection());
        assert!(Error::AddressNotOffered(ip).is_rejection());
        assert!(!Error::PoolExhausted.is_rejection());
        assert!(
            !Error::StoreUnavailable(StoreError::Backend {
                reason: "down".to_string()
            })
            .is_rejection()
        );
    }
}
