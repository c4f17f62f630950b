//! Clipboard image payloads.
//!
//! An [`ImagePayload`] is the immutable unit of work handed to the engine by
//! the clipboard collaborator: raw bytes, a SHA-256 content hash derived on
//! construction, and a format sniffed from the leading magic bytes. The hash
//! drives both dedup and deterministic destination naming, so it is computed
//! exactly once.

use std::sync::Arc;

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};

/// Image format detected from magic bytes, used to pick a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    Webp,
}

impl ImageFormat {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Webp => "webp",
        }
    }

    /// Sniff the format from the first bytes of the buffer.
    ///
    /// Clipboard screenshots are PNG on every platform this engine targets,
    /// so PNG is the fallback when no signature matches.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
            ImageFormat::Png
        } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
            ImageFormat::Jpeg
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            ImageFormat::Gif
        } else if bytes.starts_with(b"BM") {
            ImageFormat::Bmp
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            ImageFormat::Tiff
        } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
            ImageFormat::Webp
        } else {
            ImageFormat::Png
        }
    }
}

/// Number of hash characters embedded in generated filenames.
const FILENAME_HASH_LEN: usize = 8;

/// An immutable clipboard image plus its derived content hash and format.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    bytes: Arc<[u8]>,
    content_hash: String,
    format: ImageFormat,
}

impl ImagePayload {
    /// Wrap raw image bytes, computing the content hash and sniffing the
    /// format. The buffer is never mutated afterwards.
    pub fn new(bytes: Vec<u8>) -> Self {
        let content_hash = hex::encode(Sha256::digest(&bytes));
        let format = ImageFormat::sniff(&bytes);
        Self {
            bytes: bytes.into(),
            content_hash,
            format,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Full hex-encoded SHA-256 of the payload bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Truncated hash used in generated filenames.
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..FILENAME_HASH_LEN]
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Deterministic filename for this payload at the given instant:
    /// `clipboard_image_{YYYYmmdd_HHMMSS}_{hash8}.{ext}`.
    ///
    /// Pure function of the payload and the timestamp; no filesystem or
    /// network round-trip is involved.
    pub fn file_name(&self, at: DateTime<Local>) -> String {
        format!(
            "clipboard_image_{}_{}.{}",
            at.format("%Y%m%d_%H%M%S"),
            self.short_hash(),
            self.format.extension()
        )
    }
}

/// Join a generated filename to a temp root using forward slashes.
///
/// Destination paths are strings, not `PathBuf`s: remote roots follow the
/// remote host's conventions and must never be rewritten by the local
/// platform's path logic.
pub fn join_root(root: &str, file_name: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("/{}", file_name)
    } else {
        format!("{}/{}", trimmed, file_name)
    }
}
