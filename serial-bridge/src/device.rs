//! Serial device availability checks.

use nix::unistd::{AccessFlags, access};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

/// Check that `path` exists and can be opened for reading and writing.
///
/// Uses `access(2)` rather than opening the device, so modem control lines
/// are left alone. Takes no locks and has no side effects.
pub fn validate_device(path: &Path) -> BridgeResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| BridgeError::device(path, e))?;

    if metadata.is_dir() {
        return Err(BridgeError::device(path, "path is a directory"));
    }

    access(path, AccessFlags::R_OK | AccessFlags::W_OK)
        .map_err(|errno| BridgeError::device(path, errno.desc()))?;

    if !metadata.file_type().is_char_device() {
        debug!(
            "{} is not a character device, passing it to the bridge anyway",
            path.display()
        );
    }

    Ok(())
}
