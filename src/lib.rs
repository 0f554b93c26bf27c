// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, single-file key-value storage engine based on an
//! append-only, copy-on-write B-tree.
//!
//! ##### About
//!
//! This crate exports a [`Database`]: an ordered map of opaque byte keys to
//! opaque byte values, embedded in-process and persisted in a single file.
//!
//! The file is a log of immutable B-tree nodes: updates append the
//! rewritten path and then a small header record that atomically publishes
//! the new root. Because old roots stay valid forever, readers get
//! consistent MVCC [`Snapshot`]s without locking anything, and crash
//! recovery is a backwards scan for the most recent header that parses;
//! torn tail writes are skipped, never repaired in place.
//!
//! Appending forever also means the file accumulates superseded data. A
//! background compaction rebuilds the live entries into a fresh file,
//! catches up with concurrent writes, atomically takes over and cleans the
//! old file up.
//!
//! Writers go through a single writer slot handed out in FIFO order;
//! [`Database::transaction`] gives multi-key atomicity on top of it.
//!
//! Keys and values are limited to 2^32 bytes each.
//!
//! # Example usage
//!
//! ```
//! use cub::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(&folder).open()?;
//!
//! // Single-entry writes commit on their own
//! db.insert("planet", "earth")?;
//! assert_eq!(Some("earth".into()), db.get("planet")?);
//!
//! // Multiple writes commit atomically inside a transaction
//! db.transaction(|tx| {
//!     tx.insert("star", "sun")?;
//!     tx.remove("planet")?;
//!     Ok(())
//! })?;
//!
//! // Search by range, forwards or backwards
//! for item in db.range("a"..="z").rev() {
//!     let (key, value) = item?;
//!     // ...
//! }
//!
//! // Snapshots pin a point-in-time view
//! let snapshot = db.snapshot(None);
//! db.insert("star", "proxima")?;
//! assert_eq!(Some("sun".into()), snapshot.get("star")?);
//! #
//! # Ok::<(), cub::Error>(())
//! ```
//!
//! For durability against power loss, enable
//! [`Config::auto_file_sync`] (or call [`Database::file_sync`] at points of
//! your choosing); committed writes otherwise sit in OS buffers for a
//! while, though the on-disk state always recovers to *some* committed
//! root.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod block;

mod cache;
mod cleanup;

#[doc(hidden)]
pub mod coding;

mod compaction;
mod config;
mod db;
mod error;

#[doc(hidden)]
pub mod file;

mod node;
mod slice;
mod snapshot;
mod store;
mod transaction;

#[doc(hidden)]
pub mod tree;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

pub use {
    coding::{DecodeError, EncodeError},
    config::{AutoCompact, Config},
    db::{Database, Iter},
    error::{Error, Result},
    slice::Slice,
    snapshot::Snapshot,
    transaction::{Refetch, Transaction},
};
