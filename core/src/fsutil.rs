use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

/// Deletes `path`, treating an absent file as done. Other failures are
/// logged and otherwise ignored.
pub(crate) fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to delete file");
            false
        }
    }
}
