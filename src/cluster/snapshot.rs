//! Snapshot files: same framing as gossip, replaced atomically.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::types::Result;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| ".snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a snapshot via write-to-temp-then-rename.
///
/// The temp file lives in the target directory so the rename stays on one
/// filesystem. The writer callback streams records into the temp file;
/// its return value (bytes written) is passed through.
pub fn replace_file<F>(path: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut dyn Write) -> Result<u64>,
{
    let tmp = tmp_path(path);
    let size = {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        let size = match write(&mut writer) {
            Ok(size) => size,
            Err(e) => {
                drop(writer);
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        size
    };
    fs::rename(&tmp, path)?;
    Ok(size)
}
