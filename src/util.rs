//! Small shared helpers: dataset file naming and the NFS-visibility wait.

use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{FfError, Result};

/// Index file name inside an output directory.
pub const INDEX_FILE_NAME: &str = "pack.idx";

/// Presence-mask file name inside an output directory.
pub const PRESENCE_FILE_NAME: &str = "pack.presence";

/// Name of the `seq`-th split data file (`pack.00`, `pack.01`, ...).
pub fn split_file_name(seq: u32) -> String {
    format!("pack.{seq:02}")
}

/// Sleep while `path`'s mtime is within `delay` of now.
///
/// Freshly written index and presence files can take a moment to become
/// visible through NFS; waiting until the file has cooled off is a
/// scheduling workaround, not error recovery. A zero delay disables it.
pub(crate) fn wait_if_too_new(path: &Path, delay: Duration) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| FfError::io(path, e))?;
    let wait = match SystemTime::now().duration_since(mtime) {
        Ok(age) if age >= delay => return Ok(()),
        Ok(age) => delay - age,
        // mtime in the future; wait out the whole delay
        Err(_) => delay,
    };
    debug!("{:?} is too new, waiting {:?}", path, wait);
    thread::sleep(wait);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_file_names() {
        assert_eq!(split_file_name(0), "pack.00");
        assert_eq!(split_file_name(7), "pack.07");
        assert_eq!(split_file_name(42), "pack.42");
        assert_eq!(split_file_name(100), "pack.100");
    }
}
