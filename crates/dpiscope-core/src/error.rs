//! Error types for dpiscope-core
//!
//! Centralized error handling using `thiserror`. Data-quality problems (missing
//! samples, malformed packets on the hot path) are not errors here: they are
//! represented as low-confidence results or as "pass through" verdicts.

use thiserror::Error;

/// Main error type for dpiscope-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Packet parsing failed
    #[error("Packet parsing error: {message}")]
    PacketParse {
        /// Detailed error message
        message: String,
        /// Offset in packet where error occurred
        offset: Option<usize>,
    },

    /// Packet is too small to process
    #[error("Packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual packet size
        actual: usize,
    },

    /// A header length field points outside the buffer
    #[error("Invalid {field} length {value} for a {buffer_len}-byte buffer")]
    InvalidHeaderLength {
        /// Which header field was rejected
        field: &'static str,
        /// Decoded value of the field
        value: usize,
        /// Length of the buffer it was checked against
        buffer_len: usize,
    },

    /// A packet filter failed while processing a packet
    #[error("Filter '{filter}' failed: {message}")]
    Filter {
        /// Name of the filter that failed
        filter: String,
        /// Error message
        message: String,
    },

    /// Packet technique could not be applied
    #[error("Technique '{technique}' failed: {message}")]
    Technique {
        /// Name of the technique that failed
        technique: &'static str,
        /// Error message
        message: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Bypass engine rejected or failed to apply options
    #[error("Bypass engine error: {0}")]
    Engine(String),

    /// DNS / DoH controller failure
    #[error("DNS controller error: {0}")]
    Dns(String),

    /// Persisted state could not be read or written
    #[error("Persistence error for '{path}': {message}")]
    Persist {
        /// File involved
        path: String,
        /// Error message
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a packet parse error
    pub fn packet_parse(message: impl Into<String>) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: None,
        }
    }

    /// Create a packet parse error with offset
    pub fn packet_parse_at(message: impl Into<String>, offset: usize) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Create a filter error
    pub fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Filter {
            filter: filter.into(),
            message: message.into(),
        }
    }

    /// Create a technique error
    pub fn technique(technique: &'static str, message: impl Into<String>) -> Self {
        Self::Technique {
            technique,
            message: message.into(),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persist(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persist {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::packet_parse("Invalid header");
        assert!(err.to_string().contains("Invalid header"));

        let err = Error::filter("rst-inspector", "poisoned state");
        assert!(err.to_string().contains("rst-inspector"));
        assert!(err.to_string().contains("poisoned state"));
    }

    #[test]
    fn test_error_with_offset() {
        let err = Error::packet_parse_at("Invalid byte", 42);
        match err {
            Error::PacketParse { offset, .. } => assert_eq!(offset, Some(42)),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_header_length_display() {
        let err = Error::InvalidHeaderLength {
            field: "tcp data offset",
            value: 60,
            buffer_len: 40,
        };
        let text = err.to_string();
        assert!(text.contains("tcp data offset"));
        assert!(text.contains("60"));
    }
}
