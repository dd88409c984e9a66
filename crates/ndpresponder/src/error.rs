//! Error types for ndpresponder
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use thiserror::Error;

/// Errors that can occur in ndpresponder
///
/// Startup code propagates these to `main`, which exits with status 1.
/// Per-packet and per-event code logs them and moves on.
#[derive(Debug, Error)]
pub enum NdpError {
    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configured subnet did not parse
    #[error("Invalid prefix {entry:?}: {reason}")]
    InvalidPrefix { entry: String, reason: String },

    /// Interface lookup failed
    /// NIST: CM-8 (System Component Inventory) - Interface tracking
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Netlink socket error
    /// NIST: SC-7 (Boundary Protection) - Kernel interface errors
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Raw packet socket error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame could not be built from the given inputs
    #[error("Encode error: {0}")]
    Encode(String),

    /// Membership event stream could not be established
    /// NIST: SI-4 (System Monitoring) - Lost visibility of endpoint changes
    #[error("Event subscription error: {0}")]
    Subscription(String),

    /// Docker Engine API error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// IO error
    /// NIST: SI-11 (Error Handling) - System-level errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ndpresponder operations
pub type Result<T> = std::result::Result<T, NdpError>;
