// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block,
    cache::Cache,
    coding::{Decode, DecodeError, Encode},
    file::read_exact_at,
    node::{Header, Node},
};
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashSet;
use std::{
    fs::File,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{Acquire, Release},
        },
        Arc, Mutex, OnceLock,
    },
};

/// Intra-process registry of opened store files
///
/// One store may own a given file at a time; a second open of the same
/// (canonicalized) path fails with [`crate::Error::AlreadyInUse`].
fn lock_table() -> &'static Mutex<FxHashSet<PathBuf>> {
    static LOCK_TABLE: OnceLock<Mutex<FxHashSet<PathBuf>>> = OnceLock::new();
    LOCK_TABLE.get_or_init(Mutex::default)
}

fn next_store_id() -> u64 {
    static STORE_ID: AtomicU64 = AtomicU64::new(0);
    STORE_ID.fetch_add(1, Release)
}

struct Writer {
    file: File,
    pos: u64,
}

struct StoreInner {
    id: u64,

    path: PathBuf,

    /// The key held in the process-wide lock table
    lock_key: PathBuf,

    /// Write handle, cursor always at logical end-of-file
    writer: Mutex<Writer>,

    /// Separate handle for positional reads, so reads do not contend
    /// with appends
    reader: File,

    /// End-of-file as of the last successful append
    len: AtomicU64,

    cache: Arc<Cache>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        lock_table()
            .lock()
            .expect("lock is poisoned")
            .remove(&self.lock_key);
    }
}

/// Handle to an append-only data file
///
/// The store owns its file exclusively for its entire lifetime. Appends are
/// serialized through an internal mutex; positional reads run concurrently
/// with each other and observe only bytes that were fully appended when the
/// read began.
#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

impl Store {
    /// Opens (creating if needed) the data file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, cache: Arc<Cache>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let lock_key = std::fs::canonicalize(&path)?;

        {
            #[allow(clippy::expect_used)]
            let mut table = lock_table().lock().expect("lock is poisoned");

            if !table.insert(lock_key.clone()) {
                log::warn!("{path:?} is already open inside this process");
                return Err(crate::Error::AlreadyInUse);
            }
        }

        let pos = file.seek(SeekFrom::End(0))?;
        let reader = File::open(&path)?;

        log::debug!("Opened store {path:?} at len={pos}");

        Ok(Self(Arc::new(StoreInner {
            id: next_store_id(),
            path,
            lock_key,
            writer: Mutex::new(Writer { file, pos }),
            reader,
            len: AtomicU64::new(pos),
            cache,
        })))
    }

    /// Returns the process-unique ID of this store.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Returns the path of the owned file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Returns the logical file length.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.0.len.load(Acquire)
    }

    /// Returns `true` if nothing was ever appended.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.len() == 0
    }

    /// Appends a node record, returning its location.
    pub fn put_node(&self, node: &Node) -> crate::Result<u64> {
        let record = Self::record_bytes(node);

        #[allow(clippy::expect_used)]
        let mut writer = self.0.writer.lock().expect("lock is poisoned");

        let loc = writer.pos;
        let framed = block::encode(&record, loc);
        self.append(&mut writer, &framed)?;

        // Index nodes are read over and over; terminals usually once
        if matches!(node, Node::Leaf(_) | Node::Branch(_)) {
            self.0.cache.insert(self.0.id, loc, Arc::new(node.clone()));
        }

        Ok(loc)
    }

    /// Appends a header record at the next block boundary, returning its
    /// block-aligned location.
    pub fn put_header(&self, header: &Header) -> crate::Result<u64> {
        let record = Self::record_bytes(header);

        #[allow(clippy::expect_used)]
        let mut writer = self.0.writer.lock().expect("lock is poisoned");

        let (loc, framed) = block::add_header_marker(&record, writer.pos);
        self.append(&mut writer, &framed)?;

        Ok(loc)
    }

    /// Reads the node at `loc`.
    pub fn get_node(&self, loc: u64) -> crate::Result<Arc<Node>> {
        if let Some(node) = self.0.cache.get(self.0.id, loc) {
            return Ok(node);
        }

        let payload = self.read_record(loc)?;
        let node = Node::decode_from(&mut &payload[..])?;

        let node = Arc::new(node);
        self.0.cache.insert(self.0.id, loc, node.clone());

        Ok(node)
    }

    /// Reads the header at `loc`.
    pub fn get_header(&self, loc: u64) -> crate::Result<Header> {
        let payload = self.read_record(loc)?;
        Ok(Header::decode_from(&mut &payload[..])?)
    }

    /// Finds the most recent header that parses.
    ///
    /// Scans backwards one block at a time from the end of the file, so a
    /// torn write at the tail (or a corrupted late header) falls back to the
    /// previous successfully committed state.
    pub fn latest_header(&self) -> crate::Result<Option<(u64, Header)>> {
        let eof = self.len();

        if eof == 0 {
            return Ok(None);
        }

        let mut loc = block::latest_possible_header_offset(eof);

        loop {
            let mut marker = [0];

            match read_exact_at(&self.0.reader, &mut marker, loc) {
                Ok(()) => {
                    if marker[0] == block::HEADER_MARKER {
                        match self.get_header(loc) {
                            Ok(header) => return Ok(Some((loc, header))),
                            Err(crate::Error::Decode(e)) => {
                                log::warn!(
                                    "Skipping unreadable header candidate at {loc}: {e:?}",
                                );
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Block got truncated away under us; keep scanning
                }
                Err(e) => return Err(e.into()),
            }

            if loc == 0 {
                return Ok(None);
            }

            loc -= block::BLOCK_SIZE;
        }
    }

    /// Issues a datasync on the file.
    pub fn sync(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let writer = self.0.writer.lock().expect("lock is poisoned");

        writer.file.sync_data()?;

        Ok(())
    }

    fn record_bytes<T: Encode>(item: &T) -> Vec<u8> {
        let payload = item.encode_into_vec();

        // NOTE: Payloads are limited to 2^32 bytes
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;

        let mut record = Vec::with_capacity(payload.len() + 4);
        record.extend(u32::to_be_bytes(len));
        record.extend(payload);

        record
    }

    fn append(&self, writer: &mut Writer, framed: &[u8]) -> crate::Result<()> {
        if let Err(e) = writer.file.write_all(framed) {
            // A partial append must not poison subsequent appends; reseat
            // the cursor onto the true end-of-file before bailing
            match writer.file.seek(SeekFrom::End(0)) {
                Ok(pos) => {
                    writer.pos = pos;
                    self.0.len.store(pos, Release);
                }
                Err(e) => log::error!("Failed to reseat write cursor: {e:?}"),
            }

            return Err(e.into());
        }

        writer.pos += framed.len() as u64;
        self.0.len.store(writer.pos, Release);

        Ok(())
    }

    /// Performs a framed read of the length-prefixed record at `pos`.
    fn read_record(&self, pos: u64) -> crate::Result<Vec<u8>> {
        let prefix = self.read_framed(pos, 4)?;
        let len = u64::from(BigEndian::read_u32(&prefix));

        let payload_pos = pos + block::framed_len(pos, 4);
        self.read_framed(payload_pos, len)
    }

    fn read_framed(&self, pos: u64, n: u64) -> crate::Result<Vec<u8>> {
        #[allow(clippy::cast_possible_truncation)]
        let mut raw = vec![0; block::framed_len(pos, n) as usize];

        read_exact_at(&self.0.reader, &mut raw, pos).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                // Truncated record (torn tail write)
                crate::Error::Decode(DecodeError::Io(e))
            } else {
                crate::Error::Io(e)
            }
        })?;

        Ok(block::decode(&raw, pos))
    }
}
