// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{Context, Result};

/// Writes `contents` to `path` unless the file already holds exactly those
/// bytes, in which case the file (and its mtime) is left alone.
///
/// Returns `true` if the file was written.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> Result<bool> {
    if let Ok(existing) = std::fs::read(path) {
        if existing == contents {
            log::debug!("{} (unchanged)", path.display());
            return Ok(false);
        }
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("could not write {}", path.display()))?;
    log::debug!("wrote {}", path.display());
    Ok(true)
}

/// Removes `path`, treating a file that is already gone as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)
            .with_context(|| format!("could not remove {}", path.display())),
    }
}
