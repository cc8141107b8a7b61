//! Error taxonomy for transfer sessions, copies and verification.
//!
//! Every fatal condition maps to one variant so callers can match on what went
//! wrong. `Cancelled` is kept apart from the failure variants: a front-end
//! should treat it as a silent abort rather than something to report.

use std::io;

/// Errors produced by the transfer session, the copy engine and the verifier.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The provisioning record did not yield usable connection parameters.
    #[error("Cannot connect to transfer endpoint: {0}")]
    Connection(String),

    /// Every connect attempt failed.
    #[error("Failed to connect to iSCSI target after {attempts} attempt(s)")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last_error: anyhow::Error,
    },

    /// A session was established but no disk could be opened on it.
    #[error("Cannot open iSCSI disk: {message}")]
    DiskOpen {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The provisioning record is not well-formed XML.
    #[error("Malformed transfer record: {0}")]
    RecordParse(String),

    /// The remote endpoint could not be exposed.
    #[error("Failed to provision transfer endpoint")]
    Provision(#[source] anyhow::Error),

    /// A plugin call was about to be sent without one of its required arguments.
    #[error("Plugin call '{function}' is missing required argument '{key}'")]
    InvalidPluginArgs { function: &'static str, key: &'static str },

    /// Reading the source or writing the destination failed.
    #[error("Failed to copy {label}")]
    Copy {
        label: String,
        #[source]
        source: io::Error,
    },

    /// The re-read destination does not hash to the digest recorded during the copy.
    #[error("Verification of {label} failed: digest mismatch")]
    Verification { label: String },

    /// Reading the destination back failed during verification.
    #[error("Failed to verify {label}")]
    VerifyIo {
        label: String,
        #[source]
        source: io::Error,
    },

    /// The remote endpoint could not be released.
    #[error("Failed to shut down transfer endpoint")]
    Teardown(#[source] anyhow::Error),

    #[error("No iSCSI disk is open")]
    NotConnected,

    #[error("A transfer endpoint is already provisioned; disconnect first")]
    AlreadyConnected,

    /// Cooperative cancellation was observed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// True when the operation stopped because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    pub(crate) fn disk_open(message: impl Into<String>) -> Self {
        TransferError::DiskOpen {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn copy(label: &str, source: io::Error) -> Self {
        TransferError::Copy {
            label: label.to_string(),
            source,
        }
    }

    pub(crate) fn verify_io(label: &str, source: io::Error) -> Self {
        TransferError::VerifyIo {
            label: label.to_string(),
            source,
        }
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
