//! Content-addressable fingerprints for asset blobs.
//!
//! A fingerprint has the form `{extension}.{byteLength}.sha1.{hexDigest}`, e.g.
//! `png.48213.sha1.ab12…`. Identical bytes with the same extension hint always
//! produce the same fingerprint, so it doubles as a deduplication and cache key.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Extension used when neither a filename nor a MIME type resolves
pub const FALLBACK_EXTENSION: &str = "bin";

/// Digest algorithm tag embedded in every fingerprint
const DIGEST_TAG: &str = "sha1";

/// Length of a hex-encoded SHA-1 digest
const DIGEST_HEX_LEN: usize = 40;

/// Known MIME types and the extensions they map to; the first extension is canonical.
const MIME_EXTENSIONS: &[(&str, &[&str])] = &[
    ("video/mp4", &["mp4", "m4v"]),
    ("video/mov", &["mov", "mp4"]),
    ("video/quicktime", &["mov", "mp4"]),
    ("video/webm", &["webm"]),
    ("audio/mpeg", &["mp3"]),
    ("audio/wav", &["wav"]),
    ("image/png", &["png"]),
    ("image/gif", &["gif"]),
    ("image/webp", &["webp"]),
    ("image/bmp", &["bmp"]),
    ("image/jpeg", &["jpg", "jpeg"]),
    ("image/tiff", &["tif", "tiff"]),
    ("image/heic", &["heic"]),
    ("image/heif", &["heif"]),
    ("image/svg+xml", &["svg"]),
    ("text/plain", &["txt"]),
    ("text/uri-list", &["txt"]),
    ("font/woff2", &["woff2"]),
    ("application/pdf", &["pdf"]),
    ("application/vnd.ms-powerpoint", &["ppt", "pptx"]),
    ("application/vnd.apple.keynote", &["key"]),
];

/// Errors produced when parsing a fingerprint string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Malformed fingerprint: {0}")]
    Malformed(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),

    #[error("Invalid byte length in fingerprint: {0}")]
    InvalidLength(String),

    #[error("Invalid digest in fingerprint: {0}")]
    InvalidDigest(String),
}

/// A stable content-addressable identifier for a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of `bytes` using an explicit filename and/or MIME type.
    ///
    /// The filename's extension wins when present, then the MIME type, then
    /// [`FALLBACK_EXTENSION`].
    pub fn for_content(bytes: &[u8], filename: Option<&str>, mime_type: Option<&str>) -> Self {
        let extension = filename
            .and_then(extension_for_filename)
            .or_else(|| mime_type.and_then(extension_for_mime_type))
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());

        let digest = Sha1::digest(bytes);
        Self(format!(
            "{}.{}.{}.{}",
            extension,
            bytes.len(),
            DIGEST_TAG,
            hex::encode(digest)
        ))
    }

    /// Parse and validate a fingerprint string
    pub fn parse(value: &str) -> Result<Self, FingerprintError> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() != 4 || parts[0].is_empty() {
            return Err(FingerprintError::Malformed(value.to_string()));
        }
        if parts[1].parse::<u64>().is_err() {
            return Err(FingerprintError::InvalidLength(value.to_string()));
        }
        if parts[2] != DIGEST_TAG {
            return Err(FingerprintError::UnsupportedDigest(parts[2].to_string()));
        }
        let digest = parts[3];
        if digest.len() != DIGEST_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidDigest(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The extension component, e.g. `png`
    pub fn extension(&self) -> &str {
        self.0.split('.').next().unwrap_or(FALLBACK_EXTENSION)
    }

    /// The content length recorded in the fingerprint
    pub fn byte_length(&self) -> Option<u64> {
        self.0.split('.').nth(1).and_then(|len| len.parse().ok())
    }

    /// The hex digest component
    pub fn digest(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    /// MIME type implied by the extension, if it is a known one
    pub fn mime_type(&self) -> Option<&'static str> {
        mime_type_for_extension(self.extension())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute a fingerprint from bytes plus a single hint that is either a filename
/// (`"slide.png"`) or a MIME type (`"image/png"`).
pub fn fingerprint_for(bytes: &[u8], name_or_mime_hint: &str) -> Fingerprint {
    let hint = name_or_mime_hint.trim();
    if looks_like_mime_type(hint) {
        Fingerprint::for_content(bytes, None, Some(hint))
    } else {
        Fingerprint::for_content(bytes, Some(hint), None)
    }
}

/// MIME type registered for an extension
pub fn mime_type_for_extension(extension: &str) -> Option<&'static str> {
    let extension = extension.trim().to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(_, exts)| exts.contains(&extension.as_str()))
        .map(|(mime, _)| *mime)
}

/// Canonical extension for a MIME type
pub fn extension_for_mime_type(mime_type: &str) -> Option<String> {
    let lowered = mime_type.trim().to_ascii_lowercase();
    // Some platforms report "web image/png"
    let mime = lowered.strip_prefix("web ").unwrap_or(lowered.as_str());
    MIME_EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == mime)
        .and_then(|(_, exts)| exts.first())
        .map(|ext| ext.to_string())
}

fn extension_for_filename(filename: &str) -> Option<String> {
    let (_, extension) = filename.rsplit_once('.')?;
    let extension = extension.trim().to_ascii_lowercase();
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    // Normalize aliases (jpeg -> jpg) so filename and MIME hints agree
    match mime_type_for_extension(&extension).and_then(extension_for_mime_type) {
        Some(canonical) => Some(canonical),
        None => Some(extension),
    }
}

/// Top-level MIME types; anything else containing a slash is treated as a path
const MIME_TOP_LEVEL: &[&str] = &[
    "application", "audio", "font", "image", "message", "model", "multipart", "text", "video",
];

fn looks_like_mime_type(hint: &str) -> bool {
    let hint = hint.strip_prefix("web ").unwrap_or(hint);
    match hint.split_once('/') {
        Some((kind, subtype)) => {
            !subtype.is_empty() && MIME_TOP_LEVEL.contains(&kind.to_ascii_lowercase().as_str())
        }
        None => false,
    }
}
