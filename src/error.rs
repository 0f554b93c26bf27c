// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the database
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    ///
    /// A node or header on disk could not be parsed; during recovery this
    /// makes the reverse header scan continue, on a normal read it indicates
    /// hardware trouble (or a bug) and propagates.
    Decode(DecodeError),

    /// `insert_new` found the key already mapped to a value
    AlreadyExists,

    /// A compaction is already running
    PendingCompaction,

    /// `halt_compaction` was called, but no compaction is running
    NoCompactionRunning,

    /// A snapshot was used after its time-to-live elapsed or after it was released
    ExpiredSnapshot,

    /// Another database instance inside this process already owns the file
    AlreadyInUse,

    /// A bulk load was attempted into a store that is not empty
    NotEmpty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CubError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;
