use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

/// Why a file was not accepted as an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    DisallowedExtension(String),
    Unreadable(String),
    InvalidImage(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DisallowedExtension(ext) if ext.is_empty() => f.write_str("Invalid file type"),
            Rejection::DisallowedExtension(ext) => write!(f, "Invalid file type: .{}", ext),
            Rejection::Unreadable(reason) => write!(f, "Unreadable file: {}", reason),
            Rejection::InvalidImage(reason) => write!(f, "Not a valid image: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    allowed: HashSet<String>,
}

impl ExtensionPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn check_name(&self, filename: &str) -> Result<(), Rejection> {
        let ext = extension_of(filename);
        if !self.allowed.contains(&ext) {
            return Err(Rejection::DisallowedExtension(ext));
        }
        let is_image = mime_guess::from_path(filename)
            .first()
            .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .unwrap_or(false);
        if !is_image {
            return Err(Rejection::DisallowedExtension(ext));
        }
        Ok(())
    }

    /// Full validation for content about to become an image record.
    pub fn validate(&self, filename: &str, bytes: &[u8]) -> Result<ImageFormat, Rejection> {
        self.check_name(filename)?;
        sniff(bytes).ok_or_else(|| {
            if bytes.is_empty() {
                Rejection::InvalidImage("empty file".to_string())
            } else {
                Rejection::InvalidImage("unrecognised image signature".to_string())
            }
        })
    }
}

/// Lowercased extension without the dot, empty when there is none.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Title derived from a filename: the stem.
pub fn title_of(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
}

pub fn sniff(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else if bytes.starts_with(b"BM") && bytes.len() >= 26 {
        Some(ImageFormat::Bmp)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn policy() -> ExtensionPolicy {
        ExtensionPolicy::new(["gif", "jpg", "jpeg", "png"])
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(policy().check_name("IMG1.PNG").is_ok());
        assert_eq!(
            policy().check_name("notes.txt"),
            Err(Rejection::DisallowedExtension("txt".to_string()))
        );
        assert!(policy().check_name("noext").is_err());
    }

    #[test]
    fn validate_requires_known_signature() {
        assert_eq!(policy().validate("a.png", PNG), Ok(ImageFormat::Png));
        assert!(matches!(
            policy().validate("a.png", b"plain text"),
            Err(Rejection::InvalidImage(_))
        ));
        assert!(matches!(
            policy().validate("a.jpg", b""),
            Err(Rejection::InvalidImage(_))
        ));
    }

    #[test]
    fn title_is_stem() {
        assert_eq!(title_of("img1.png"), "img1");
        assert_eq!(title_of("archive.tar.gz"), "archive.tar");
    }
}
