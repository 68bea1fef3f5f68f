//! Whole-document JSON persistence at owner-only permissions
//!
//! Every state file (keystore, UTXO cache, approvals, spend records) is
//! rewritten in full: read, mutate in memory, serialize, then write to a
//! temporary sibling and rename over the target. The directory is created
//! with mode 0700 and files with mode 0600 on Unix.
//!
//! The process is assumed to be the only writer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{IoContext, WalletError, WalletResult};
use crate::logging::{log_storage, LogLevel};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

/// File mode for persisted documents
pub const FILE_MODE: u32 = 0o600;

/// Directory mode for the wallet data directory
pub const DIR_MODE: u32 = 0o700;

/// Create the directory (and parents) if needed and restrict it to the owner
pub fn ensure_private_dir(dir: &Path) -> WalletResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).io_context(format!("creating {}", dir.display()))?;
    }

    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))
        .io_context(format!("restricting {}", dir.display()))?;

    Ok(())
}

/// Serialize `value` and atomically replace `path` with it
pub fn write_json_private<T: Serialize>(path: &Path, value: &T) -> WalletResult<()> {
    // Existing parents are left alone; only directories created here are restricted
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            ensure_private_dir(parent)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");

    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);

        let mut file = options
            .open(&tmp_path)
            .io_context(format!("opening {}", tmp_path.display()))?;
        file.write_all(&bytes)
            .io_context(format!("writing {}", tmp_path.display()))?;
        file.sync_all()
            .io_context(format!("syncing {}", tmp_path.display()))?;
    }

    // A pre-existing tmp file keeps its old mode; reset it before the rename
    #[cfg(unix)]
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(FILE_MODE))
        .io_context(format!("restricting {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path).io_context(format!("replacing {}", path.display()))?;

    log_storage(
        LogLevel::Debug,
        "document written",
        Some(json!({"file": file_label(path), "bytes": bytes.len()})),
    );
    Ok(())
}

/// Read and deserialize `path`, returning `None` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> WalletResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path).io_context(format!("reading {}", path.display()))?;
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        WalletError::Serialization(format!("{}: {}", file_label(path), e))
    })?;
    Ok(Some(value))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
