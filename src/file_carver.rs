//! File-type identification by leading magic bytes.
//!
//! Used as a fallback naming aid when a recovered record carries content but
//! no usable name; never required for the primary recovery path.

/// Known file signature.
#[derive(Debug, Clone, Copy)]
pub struct FileSignature {
    pub name: &'static str,
    pub extension: &'static str,
    pub header: &'static [u8],
}

pub const SIGNATURES: &[FileSignature] = &[
    FileSignature {
        name: "JPEG image",
        extension: "jpg",
        header: &[0xFF, 0xD8, 0xFF],
    },
    FileSignature {
        name: "PNG image",
        extension: "png",
        header: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
    },
    FileSignature {
        name: "PDF document",
        extension: "pdf",
        header: &[0x25, 0x50, 0x44, 0x46, 0x2D],
    },
    FileSignature {
        name: "ZIP archive (also DOCX/XLSX)",
        extension: "zip",
        header: &[0x50, 0x4B, 0x03, 0x04],
    },
    FileSignature {
        name: "GIF87a image",
        extension: "gif",
        header: b"GIF87a",
    },
    FileSignature {
        name: "GIF89a image",
        extension: "gif",
        header: b"GIF89a",
    },
    FileSignature {
        name: "ICO icon",
        extension: "ico",
        header: &[0x00, 0x00, 0x01, 0x00],
    },
    FileSignature {
        name: "BMP image",
        extension: "bmp",
        header: &[0x42, 0x4D],
    },
];

/// First signature whose header prefixes `buffer`, or None.
pub fn identify(buffer: &[u8]) -> Option<&'static FileSignature> {
    SIGNATURES.iter().find(|sig| buffer.starts_with(sig.header))
}
