// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::{self, FileKind};
use std::path::Path;

/// Removes every recognized file whose counter is smaller than the live
/// file's counter.
///
/// After a finished compaction this sweeps the previous database file (and
/// any stale compaction leftovers below it). Must only run once no snapshot
/// pins a non-current file anymore.
pub fn remove_superseded_files(folder: &Path, current: &Path) -> std::io::Result<()> {
    let Some(current_name) = current.file_name().and_then(|x| x.to_str()) else {
        return Ok(());
    };

    let Some((current_counter, _)) = file::parse_file_name(current_name) else {
        return Ok(());
    };

    for (counter, _, path) in file::list_recognized_files(folder)? {
        if counter < current_counter {
            log::debug!("Removing superseded file {path:?}");
            std::fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Removes every compaction target except `keep`.
///
/// Run before starting a compaction and when opening a database, to get rid
/// of targets left behind by crashed or halted compactions.
pub fn remove_stale_compaction_files(folder: &Path, keep: Option<&Path>) -> std::io::Result<()> {
    for (_, kind, path) in file::list_recognized_files(folder)? {
        if kind == FileKind::Compact && Some(path.as_path()) != keep {
            log::debug!("Removing stale compaction file {path:?}");
            std::fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn touch(folder: &Path, name: &str) {
        std::fs::write(folder.join(name), b"x").unwrap();
    }

    fn names(folder: &Path) -> Vec<String> {
        let mut names = std::fs::read_dir(folder)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_str().unwrap().to_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn cleanup_superseded() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        for name in ["0.cub", "1.cub", "1.compact", "2.cub", "3.compact", "notes.txt"] {
            touch(folder.path(), name);
        }

        remove_superseded_files(folder.path(), &folder.path().join("2.cub"))?;

        assert_eq!(vec!["2.cub", "3.compact", "notes.txt"], names(folder.path()));

        Ok(())
    }

    #[test]
    fn cleanup_stale_compactions() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        for name in ["2.cub", "3.compact", "4.compact"] {
            touch(folder.path(), name);
        }

        let keep = folder.path().join("4.compact");
        remove_stale_compaction_files(folder.path(), Some(&keep))?;

        assert_eq!(vec!["2.cub", "4.compact"], names(folder.path()));

        remove_stale_compaction_files(folder.path(), None)?;
        assert_eq!(vec!["2.cub"], names(folder.path()));

        Ok(())
    }
}
