// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block framing layer
//!
//! The data file is divided into blocks of [`BLOCK_SIZE`] bytes. The first
//! byte of every block is a marker, [`DATA_MARKER`] or [`HEADER_MARKER`],
//! and the remaining bytes carry record payload. A logical record spans as
//! many blocks as it needs; the framer transparently weaves the markers in
//! on write and strips them on read.
//!
//! Header records are the exception: they always sit at the start of a
//! block, which is what makes an O(file size / block size) reverse scan for
//! the most recent header possible after an unclean shutdown.

/// Size of a single block in bytes.
pub const BLOCK_SIZE: u64 = 1_024;

/// Marker byte of a block that continues or starts plain records.
pub const DATA_MARKER: u8 = 0x00;

/// Marker byte of a block that starts with a header record.
pub const HEADER_MARKER: u8 = 0x2A;

/// Frames `bytes` for writing at file offset `pos`.
///
/// A marker byte is emitted whenever the write crosses (or starts on) a
/// block boundary.
#[must_use]
pub fn encode(bytes: &[u8], pos: u64) -> Vec<u8> {
    encode_with_marker(bytes, pos, DATA_MARKER)
}

fn encode_with_marker(bytes: &[u8], pos: u64, first_marker: u8) -> Vec<u8> {
    // NOTE: Every boundary after the first gets a DATA marker, even inside
    // a header record; only the block a header *starts* in is special.
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / (BLOCK_SIZE as usize) + 2);

    let mut pos = pos;
    let mut rest = bytes;
    let mut marker = first_marker;

    while !rest.is_empty() {
        if pos % BLOCK_SIZE == 0 {
            out.push(marker);
            marker = DATA_MARKER;
            pos += 1;
        }

        #[allow(clippy::cast_possible_truncation)]
        let space = (BLOCK_SIZE - (pos % BLOCK_SIZE)) as usize;
        let take = space.min(rest.len());

        let (chunk, tail) = rest.split_at(take);
        out.extend_from_slice(chunk);

        pos += take as u64;
        rest = tail;
    }

    out
}

/// Strips block markers from `raw` file bytes that were read at offset `pos`.
#[must_use]
pub fn decode(raw: &[u8], pos: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());

    let mut pos = pos;
    let mut rest = raw;

    while !rest.is_empty() {
        if pos % BLOCK_SIZE == 0 {
            // Marker byte
            rest = rest.get(1..).unwrap_or_default();
            pos += 1;
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let space = (BLOCK_SIZE - (pos % BLOCK_SIZE)) as usize;
        let take = space.min(rest.len());

        let (chunk, tail) = rest.split_at(take);
        out.extend_from_slice(chunk);

        pos += take as u64;
        rest = tail;
    }

    out
}

/// Returns the number of file bytes occupied by `n` logical bytes written at
/// offset `pos`.
#[must_use]
pub fn framed_len(pos: u64, n: u64) -> u64 {
    if n == 0 {
        return 0;
    }

    let offset = pos % BLOCK_SIZE;

    let (first_marker, first_capacity) = if offset == 0 {
        (1, BLOCK_SIZE - 1)
    } else {
        (0, BLOCK_SIZE - offset)
    };

    if n <= first_capacity {
        return first_marker + n;
    }

    let rest = n - first_capacity;
    let full_blocks = rest / (BLOCK_SIZE - 1);
    let tail = rest % (BLOCK_SIZE - 1);

    first_marker + first_capacity + full_blocks * BLOCK_SIZE + if tail > 0 { 1 + tail } else { 0 }
}

/// Frames `bytes` as a header record written at offset `pos`.
///
/// Returns the block-aligned offset the header marker lands on, plus the
/// file bytes to append at `pos`: padding up to the next block boundary (if
/// `pos` is unaligned), the header marker, then the framed payload.
#[must_use]
pub fn add_header_marker(bytes: &[u8], pos: u64) -> (u64, Vec<u8>) {
    let offset = pos % BLOCK_SIZE;

    if offset == 0 {
        (pos, encode_with_marker(bytes, pos, HEADER_MARKER))
    } else {
        let pad = BLOCK_SIZE - offset;
        let loc = pos + pad;

        #[allow(clippy::cast_possible_truncation)]
        let mut out = vec![0; pad as usize];
        out.extend(encode_with_marker(bytes, loc, HEADER_MARKER));

        (loc, out)
    }
}

/// Returns the largest multiple of the block size strictly below `pos`.
///
/// This is the last file offset a header record could possibly start at.
#[must_use]
pub fn latest_possible_header_offset(pos: u64) -> u64 {
    if pos <= BLOCK_SIZE {
        0
    } else {
        ((pos - 1) / BLOCK_SIZE) * BLOCK_SIZE
    }
}
