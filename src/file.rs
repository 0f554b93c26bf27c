// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// Extension of live database files.
pub const DATA_FILE_EXT: &str = "cub";

/// Extension of in-progress (or crashed) compaction targets.
pub const COMPACT_FILE_EXT: &str = "compact";

/// The role a file inside the data directory plays, by its extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    /// A database file (`<hex>.cub`)
    Data,

    /// A compaction target (`<hex>.compact`)
    Compact,
}

/// Formats the name of the database file with the given counter.
#[must_use]
pub fn data_file_name(counter: u64) -> String {
    format!("{counter:x}.{DATA_FILE_EXT}")
}

/// Formats the name of the compaction target with the given counter.
#[must_use]
pub fn compact_file_name(counter: u64) -> String {
    format!("{counter:x}.{COMPACT_FILE_EXT}")
}

/// Parses a file name of the form `<hex>.cub` or `<hex>.compact`.
///
/// The hex counter is case-insensitive. Anything else (including filesystem
/// litter like `.DS_Store`) is `None` and gets ignored by scans.
#[must_use]
pub fn parse_file_name(name: &str) -> Option<(u64, FileKind)> {
    let (stem, ext) = name.rsplit_once('.')?;

    let kind = if ext.eq_ignore_ascii_case(DATA_FILE_EXT) {
        FileKind::Data
    } else if ext.eq_ignore_ascii_case(COMPACT_FILE_EXT) {
        FileKind::Compact
    } else {
        return None;
    };

    let counter = u64::from_str_radix(stem, 16).ok()?;

    Some((counter, kind))
}

/// Lists every recognized file in the data directory as `(counter, kind, path)`.
pub fn list_recognized_files(folder: &Path) -> std::io::Result<Vec<(u64, FileKind, PathBuf)>> {
    let mut files = vec![];

    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;

        if !dirent.file_type()?.is_file() {
            continue;
        }

        let name = dirent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if let Some((counter, kind)) = parse_file_name(name) {
            files.push((counter, kind, dirent.path()));
        }
    }

    files.sort_by_key(|(counter, ..)| *counter);

    Ok(files)
}

/// Finds the live database file: the `.cub` with the greatest counter.
pub fn latest_data_file(folder: &Path) -> std::io::Result<Option<(u64, PathBuf)>> {
    Ok(list_recognized_files(folder)?
        .into_iter()
        .filter(|(_, kind, _)| *kind == FileKind::Data)
        .map(|(counter, _, path)| (counter, path))
        .next_back())
}

/// Returns the counter the next created file should use.
pub fn next_file_counter(folder: &Path) -> std::io::Result<u64> {
    Ok(list_recognized_files(folder)?
        .last()
        .map_or(0, |(counter, ..)| counter + 1))
}

/// Reads exactly `buf.len()` bytes at `offset` without moving any cursor.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.read_exact_at(buf, offset)
}

/// Reads exactly `buf.len()` bytes at `offset` without moving any cursor.
#[cfg(windows)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut buf = buf;
    let mut offset = offset;

    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }

        buf = &mut buf[n..];
        offset += n as u64;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
