//! Error types for the DHT tracker
//!
//! This module defines the error kinds produced by the DHT core and
//! the outer surfaces (configuration, UDP transport). None of them is
//! fatal to the core: callers log and recover locally.

use std::fmt;

/// Error type for DHT operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Malformed bencode input
    BencodeError {
        message: String,
        position: usize,
    },

    /// Malformed compact structure (node lists, state file layout)
    CodecError {
        message: String,
        source: Option<String>,
    },

    /// Identifier built from a byte string that is not 20 bytes long
    InvalidId {
        length: usize,
    },

    /// Port 0 or a bad IPv4 mapping
    AddressError {
        message: String,
        address: Option<String>,
    },

    /// Structurally valid bencode that is semantically invalid
    MessageError {
        message: String,
        field: Option<String>,
    },

    /// No unique transaction id could be allocated for a destination
    TidExhausted {
        destination: String,
    },

    /// State file persistence failures
    StateIoError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// A lookup made no progress within its deadline
    LookupTimeout {
        lookup_id: u64,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors raised by the UDP host runtime
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl DhtError {
    /// Create a new BencodeError at the given input offset
    pub fn bencode_error(message: impl Into<String>, position: usize) -> Self {
        DhtError::BencodeError {
            message: message.into(),
            position,
        }
    }

    /// Create a new CodecError
    pub fn codec_error(message: impl Into<String>) -> Self {
        DhtError::CodecError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidId error
    pub fn invalid_id(length: usize) -> Self {
        DhtError::InvalidId { length }
    }

    /// Create a new AddressError
    pub fn address_error(message: impl Into<String>) -> Self {
        DhtError::AddressError {
            message: message.into(),
            address: None,
        }
    }

    /// Create a new AddressError with the offending address
    pub fn address_error_with_addr(message: impl Into<String>, address: impl Into<String>) -> Self {
        DhtError::AddressError {
            message: message.into(),
            address: Some(address.into()),
        }
    }

    /// Create a new MessageError
    pub fn message_error(message: impl Into<String>) -> Self {
        DhtError::MessageError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new MessageError naming the offending field
    pub fn message_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::MessageError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new TidExhausted error
    pub fn tid_exhausted(destination: impl Into<String>) -> Self {
        DhtError::TidExhausted {
            destination: destination.into(),
        }
    }

    /// Create a new StateIoError with path and source
    pub fn state_io_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::StateIoError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new LookupTimeout error
    pub fn lookup_timeout(lookup_id: u64) -> Self {
        DhtError::LookupTimeout { lookup_id }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            DhtError::CodecError { source, .. }
            | DhtError::StateIoError { source, .. }
            | DhtError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            DhtError::MessageError { message, .. } | DhtError::AddressError { message, .. } => {
                *message = format!("{} ({})", message, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::BencodeError { message, position } => {
                write!(f, "Bencode error: {} (at byte {})", message, position)
            }
            DhtError::CodecError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Codec error: {} (source: {})", message, src)
                } else {
                    write!(f, "Codec error: {}", message)
                }
            }
            DhtError::InvalidId { length } => {
                write!(f, "Invalid id: expected 20 bytes, got {}", length)
            }
            DhtError::AddressError { message, address } => {
                if let Some(addr) = address {
                    write!(f, "Address error: {} (address: {})", message, addr)
                } else {
                    write!(f, "Address error: {}", message)
                }
            }
            DhtError::MessageError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Message error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Message error: {}", message)
                }
            }
            DhtError::TidExhausted { destination } => {
                write!(f, "Transaction ids exhausted for {}", destination)
            }
            DhtError::StateIoError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "State I/O error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "State I/O error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "State I/O error: {} (source: {})", message, s),
                    (None, None) => write!(f, "State I/O error: {}", message),
                }
            }
            DhtError::LookupTimeout { lookup_id } => {
                write!(f, "Lookup {} timed out", lookup_id)
            }
            DhtError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            DhtError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
        }
    }
}

impl std::error::Error for DhtError {}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::StateIoError {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::config_error(format!("Failed to parse settings: {}", err))
    }
}

impl From<std::net::AddrParseError> for DhtError {
    fn from(err: std::net::AddrParseError) -> Self {
        DhtError::config_error(format!("Failed to parse address: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bencode_error_display() {
        let err = DhtError::bencode_error("unterminated list", 7);
        assert_eq!(err.to_string(), "Bencode error: unterminated list (at byte 7)");
    }

    #[test]
    fn test_address_error_with_addr() {
        let err = DhtError::address_error_with_addr("port 0", "1.2.3.4:0");
        assert!(err.to_string().contains("Address error"));
        assert!(err.to_string().contains("1.2.3.4:0"));
    }

    #[test]
    fn test_message_error_with_field() {
        let err = DhtError::message_error_with_field("missing key", "info_hash");
        assert!(err.to_string().contains("Message error"));
        assert!(err.to_string().contains("info_hash"));
    }

    #[test]
    fn test_with_context() {
        let err = DhtError::codec_error("bad node list").with_context("while parsing nodes2");
        assert!(err.to_string().contains("while parsing nodes2"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DhtError = io_err.into();
        assert!(matches!(err, DhtError::StateIoError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: DhtError = addr_err.into();
        assert!(matches!(err, DhtError::ConfigError { .. }));
    }
}
