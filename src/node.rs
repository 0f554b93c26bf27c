// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

const TAG_LEAF: u8 = 1;
const TAG_BRANCH: u8 = 2;
const TAG_VALUE: u8 = 3;
const TAG_TOMBSTONE: u8 = 4;
const TAG_HEADER: u8 = 5;

/// An ordered list of `(key, location)` pairs
///
/// In a leaf the locations point at terminals (values or tombstones), in a
/// branch they point at child nodes and the keys act as separators.
pub type Entries = Vec<(Slice, u64)>;

/// A node in the append-only log
///
/// Nodes are immutable once written; an update rewrites the path from the
/// affected leaf up to the root at fresh offsets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// Ordered `(key, terminal location)` pairs
    Leaf(Entries),

    /// Ordered `(separator, child location)` pairs
    ///
    /// The first separator equals the smallest key that was reachable under
    /// its child when the branch was written; lookups treat the first child
    /// as a sentinel, so it may drift below that key over time.
    Branch(Entries),

    /// A stored value
    Value(Slice),

    /// Marks its key as logically deleted
    Tombstone,
}

impl Node {
    /// Returns the entry list of a leaf or branch.
    ///
    /// # Panics
    ///
    /// Panics if the node is a terminal; callers only walk leaves and
    /// branches, so reaching a terminal here is a tree-shape bug.
    #[must_use]
    pub fn entries(&self) -> &Entries {
        match self {
            Self::Leaf(entries) | Self::Branch(entries) => entries,
            _ => unreachable!("terminal node has no entries"),
        }
    }
}

fn encode_entries<W: Write>(entries: &Entries, writer: &mut W) -> Result<(), EncodeError> {
    // NOTE: Keys are limited to 2^32 bytes
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(entries.len() as u32)?;

    for (key, loc) in entries {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(key.len() as u32)?;
        writer.write_all(key)?;
        writer.write_u64_varint(*loc)?;
    }

    Ok(())
}

fn decode_entries<R: Read>(reader: &mut R) -> Result<Entries, DecodeError> {
    let count = reader.read_u32_varint()?;
    let mut entries = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let key_len = reader.read_u32_varint()?;
        let key = Slice::from_reader(reader, key_len as usize)?;
        let loc = reader.read_u64_varint()?;
        entries.push((key, loc));
    }

    Ok(entries)
}

impl Encode for Node {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Leaf(entries) => {
                writer.write_u8(TAG_LEAF)?;
                encode_entries(entries, writer)
            }
            Self::Branch(entries) => {
                writer.write_u8(TAG_BRANCH)?;
                encode_entries(entries, writer)
            }
            Self::Value(bytes) => {
                writer.write_u8(TAG_VALUE)?;

                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32_varint(bytes.len() as u32)?;
                writer.write_all(bytes)?;

                Ok(())
            }
            Self::Tombstone => {
                writer.write_u8(TAG_TOMBSTONE)?;
                Ok(())
            }
        }
    }
}

impl Decode for Node {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            TAG_LEAF => Ok(Self::Leaf(decode_entries(reader)?)),
            TAG_BRANCH => Ok(Self::Branch(decode_entries(reader)?)),
            TAG_VALUE => {
                let len = reader.read_u32_varint()?;
                let bytes = Slice::from_reader(reader, len as usize)?;
                Ok(Self::Value(bytes))
            }
            TAG_TOMBSTONE => Ok(Self::Tombstone),
            tag => Err(DecodeError::InvalidTag(("Node", tag))),
        }
    }
}

/// The commit record
///
/// A header names a root and thereby atomically publishes the tree hanging
/// off it. The latest header that fully parses defines the committed state;
/// anything after it in the file is a torn write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// Number of live (non-tombstoned) entries reachable from the root
    pub size: u64,

    /// File offset of the root node
    pub location: u64,

    /// Write events since the tree was last bulk-loaded
    ///
    /// Together with `size` this yields the dirt factor that drives
    /// auto-compaction.
    pub dirt: u64,
}

impl Encode for Header {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(TAG_HEADER)?;
        writer.write_u64::<BigEndian>(self.size)?;
        writer.write_u64::<BigEndian>(self.location)?;
        writer.write_u64::<BigEndian>(self.dirt)?;
        Ok(())
    }
}

impl Decode for Header {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        if tag != TAG_HEADER {
            return Err(DecodeError::InvalidTag(("Header", tag)));
        }

        let size = reader.read_u64::<BigEndian>()?;
        let location = reader.read_u64::<BigEndian>()?;
        let dirt = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            size,
            location,
            dirt,
        })
    }
}
