//! # Error types for the upgrade engine
//!
//! Every failure mode of an upgrade is an explicit variant so that embedders
//! can match on the kind instead of parsing messages. CLI embedders map each
//! variant to a process exit code through [`Error::exit_code`].

use std::path::PathBuf;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during an upgrade
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The link could not be opened, scanned, or exchanged packets
    #[error("link error: {0}")]
    Link(String),

    /// The device advertised a bootloader protocol outside the recognized set
    #[error("bootloader protocol 0x{0:X} not supported")]
    ProtocolUnsupported(u8),

    /// I/O error while reading the firmware file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The bundle archive could not be read
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The manifest could not be deserialized
    #[error("failed to deserialize manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// The bundle does not contain a `manifest.json` member
    #[error("no manifest.json in bundle {}", .0.display())]
    MissingManifest(PathBuf),

    /// The manifest schema version is not supported
    #[error("wrong manifest version: {0}")]
    ManifestVersion(u64),

    /// A raw binary image was given together with more than one target
    #[error("cannot flash a .bin to more than one target")]
    RawBinaryMultipleTargets,

    /// The image does not fit in the writable flash range of its target
    #[error("not enough space to flash the image file ({image} bytes, {available} available)")]
    InsufficientSpace {
        /// Length of the rejected image in bytes
        image: usize,
        /// Writable flash range of the target in bytes
        available: usize,
    },

    /// The device reported a failure while programming a page batch
    #[error("error during flash operation (code {code}): {}", crate::packets::DeviceFlashError::from(*code))]
    DeviceProgram {
        /// Raw device-reported error code
        code: u8,
    },

    /// The termination callback requested an abort
    #[error("flashing terminated")]
    Terminated,

    /// A deck write returned failure
    #[error("failed to update deck {0}")]
    DeckUpdateFailed(String),

    /// An operation was attempted in the wrong session mode
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Process exit code for CLI embedders
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InsufficientSpace { .. } => 2,
            Error::ProtocolUnsupported(_) => 3,
            Error::DeviceProgram { .. } => 4,
            Error::Terminated => 5,
            Error::Io(_)
            | Error::Zip(_)
            | Error::Json(_)
            | Error::MissingManifest(_)
            | Error::ManifestVersion(_)
            | Error::RawBinaryMultipleTargets => 6,
            Error::Link(_) => 7,
            Error::DeckUpdateFailed(_) | Error::InvalidOperation(_) => 1,
        }
    }
}
