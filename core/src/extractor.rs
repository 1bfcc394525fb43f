use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::CoreError;

#[path = "extractor/signatures.rs"]
mod signatures;

pub use signatures::{detect_extension, FALLBACK_EXTENSION, SIGNATURE_PROBE_LEN};

/// What to do when the target file of a payload is already on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingFilePolicy {
    /// Leave the existing file untouched and report it.
    #[default]
    Skip,
    /// Replace it atomically.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedImage {
    pub image_id: String,
    pub file_name: String,
    pub extension: String,
    pub size_bytes: u64,
    /// Hash of the payload bytes, not of whatever may already sit on disk.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOutcome {
    Written(ExtractedImage),
    SkippedExisting(ExtractedImage),
    /// Zero-length or absent payload; nothing is written.
    Empty,
}

pub struct BlobExtractor {
    out_dir: PathBuf,
    policy: ExistingFilePolicy,
}

impl BlobExtractor {
    /// Creates the output directory. Failing here is fatal for the run.
    pub fn new(out_dir: &Path, policy: ExistingFilePolicy) -> Result<Self, CoreError> {
        fs::create_dir_all(out_dir)?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            policy,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn policy(&self) -> ExistingFilePolicy {
        self.policy
    }

    /// Writes one payload. Errors are `BlobWrite` and concern this payload only.
    pub fn extract(&self, image_id: &str, bytes: &[u8]) -> Result<BlobOutcome, CoreError> {
        if bytes.is_empty() {
            return Ok(BlobOutcome::Empty);
        }
        let extension = detect_extension(bytes);
        let file_name = image_file_name(image_id, extension);
        let dest = self.out_dir.join(&file_name);
        let image = ExtractedImage {
            image_id: image_id.to_string(),
            file_name,
            extension: extension.to_string(),
            size_bytes: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
        };

        if self.policy == ExistingFilePolicy::Skip && dest.is_file() {
            debug!(file = %image.file_name, "image already extracted");
            return Ok(BlobOutcome::SkippedExisting(image));
        }

        let mut temp = NamedTempFile::new_in(&self.out_dir).map_err(|e| blob_error(image_id, e))?;
        temp.write_all(bytes)
            .and_then(|_| temp.flush())
            .map_err(|e| blob_error(image_id, e))?;

        match self.policy {
            ExistingFilePolicy::Overwrite => {
                temp.persist(&dest)
                    .map_err(|e| blob_error(image_id, e.error))?;
            }
            ExistingFilePolicy::Skip => match temp.persist_noclobber(&dest) {
                Ok(_) => {}
                // Lost a race with another writer of the same name.
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists && dest.is_file() => {
                    return Ok(BlobOutcome::SkippedExisting(image));
                }
                Err(e) => return Err(blob_error(image_id, e.error)),
            },
        }
        Ok(BlobOutcome::Written(image))
    }
}

fn blob_error(image_id: &str, source: io::Error) -> CoreError {
    CoreError::BlobWrite {
        content_id: image_id.to_string(),
        source,
    }
}

/// Escapes an identifier into a file stem. Distinct ids always give stems that differ
/// even on case-insensitive filesystems: lowercase ASCII letters, digits, `-`, `_` and
/// any `.` after the first character are kept, every other byte (uppercase letters and
/// `%` included) becomes `%XX`.
pub fn safe_file_stem(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(id.len());
    for (idx, byte) in id.bytes().enumerate() {
        let keep = byte.is_ascii_lowercase()
            || byte.is_ascii_digit()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && idx > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub fn image_file_name(image_id: &str, extension: &str) -> String {
    format!("{}.{}", safe_file_stem(image_id), extension)
}

#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // Fails for paths that do not exist yet; callers treat that as unknown.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let block = stat.f_frsize as u64;
    Some((stat.f_bavail as u64).saturating_mul(block))
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Option<u64> {
    None
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
