//! Object-store egress for downloaded granule archives.
//!
//! The store verifies a client-declared MD5 against the body before anything
//! is persisted, mirroring a Content-MD5-validating bucket: a corrupt body
//! never lands in the archive.

use md5::{Digest, Md5};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("content MD5 mismatch for {key}: declared {declared}, computed {computed}")]
    ChecksumMismatch {
        key: String,
        declared: String,
        computed: String,
    },
    #[error("malformed MD5 digest {0:?}")]
    BadDigest(String),
    #[error("object write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Whether a retry could plausibly succeed. Checksum mismatches count as
    /// retryable: the next attempt re-fetches the body and the authoritative
    /// checksum.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ObjectStoreError::BadDigest(_))
    }
}

/// Destination bucket for granule archives.
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, verifying it against the declared MD5 (hex).
    /// Returns the stored object's location as `<bucket>/<key>`.
    fn put_object(&self, key: &str, body: &[u8], md5_hex: &str)
        -> Result<String, ObjectStoreError>;

    fn bucket(&self) -> &str;
}

/// Convert an upstream hex MD5 to the base64 form carried in a Content-MD5
/// header.
pub fn content_md5_base64(md5_hex: &str) -> Result<String, ObjectStoreError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let raw = hex::decode(md5_hex)
        .map_err(|_| ObjectStoreError::BadDigest(md5_hex.to_string()))?;
    if raw.len() != 16 {
        return Err(ObjectStoreError::BadDigest(md5_hex.to_string()));
    }
    Ok(STANDARD.encode(raw))
}

pub fn md5_hex(body: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Filesystem-backed object store rooted at one bucket directory.
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, bucket: String) -> Self {
        FsObjectStore { root, bucket }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn put_object(
        &self,
        key: &str,
        body: &[u8],
        md5_hex_declared: &str,
    ) -> Result<String, ObjectStoreError> {
        // Reject malformed digests before touching the body
        content_md5_base64(md5_hex_declared)?;

        let computed = md5_hex(body);
        if !computed.eq_ignore_ascii_case(md5_hex_declared) {
            return Err(ObjectStoreError::ChecksumMismatch {
                key: key.to_string(),
                declared: md5_hex_declared.to_string(),
                computed,
            });
        }

        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write through a temp file so a crash never leaves a partial object
        let tmp_path = path.with_extension("part");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &path)?;

        Ok(format!("{}/{}", self.bucket, key))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
