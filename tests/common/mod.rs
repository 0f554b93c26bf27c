#![allow(dead_code)]

use std::{path::Path, time::Duration};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `cond` until it holds, panicking after a generous timeout.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();

    while !cond() {
        assert!(
            start.elapsed() < WAIT_TIMEOUT,
            "timed out waiting for: {what}",
        );

        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Lists the file names inside the data directory, sorted.
pub fn file_names(folder: &Path) -> Vec<String> {
    let mut names = std::fs::read_dir(folder)
        .expect("folder should be listable")
        .map(|entry| {
            entry
                .expect("dirent should be readable")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect::<Vec<_>>();

    names.sort();
    names
}

/// Lists file names with the given extension, sorted.
pub fn files_with_ext(folder: &Path, ext: &str) -> Vec<String> {
    file_names(folder)
        .into_iter()
        .filter(|name| name.ends_with(&format!(".{ext}")))
        .collect()
}
