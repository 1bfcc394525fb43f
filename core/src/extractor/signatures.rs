/// Bytes of a payload needed to recognise every signature below.
pub const SIGNATURE_PROBE_LEN: usize = 32;
pub const FALLBACK_EXTENSION: &str = "bin";

struct Signature {
    extension: &'static str,
    /// (offset, bytes) pairs that must all match.
    parts: &'static [(usize, &'static [u8])],
}

// Checked in order; the first match wins.
const SIGNATURES: &[Signature] = &[
    Signature {
        extension: "jpg",
        parts: &[(0, &[0xFF, 0xD8, 0xFF])],
    },
    Signature {
        extension: "png",
        parts: &[(0, &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])],
    },
    Signature {
        extension: "gif",
        parts: &[(0, b"GIF87a")],
    },
    Signature {
        extension: "gif",
        parts: &[(0, b"GIF89a")],
    },
    Signature {
        extension: "webp",
        parts: &[(0, b"RIFF"), (8, b"WEBP")],
    },
    Signature {
        extension: "bmp",
        parts: &[(0, b"BM")],
    },
    Signature {
        extension: "tif",
        parts: &[(0, b"II*\0")],
    },
    Signature {
        extension: "tif",
        parts: &[(0, b"MM\0*")],
    },
    Signature {
        extension: "heic",
        parts: &[(4, b"ftyp"), (8, b"heic")],
    },
    Signature {
        extension: "heic",
        parts: &[(4, b"ftyp"), (8, b"heix")],
    },
    Signature {
        extension: "heic",
        parts: &[(4, b"ftyp"), (8, b"mif1")],
    },
];

impl Signature {
    fn matches(&self, bytes: &[u8]) -> bool {
        self.parts.iter().all(|(offset, magic)| {
            bytes
                .get(*offset..offset + magic.len())
                .is_some_and(|window| window == *magic)
        })
    }
}

/// Depends only on the leading bytes, so the same payload always gets the same extension.
pub fn detect_extension(bytes: &[u8]) -> &'static str {
    SIGNATURES
        .iter()
        .find(|signature| signature.matches(bytes))
        .map(|signature| signature.extension)
        .unwrap_or(FALLBACK_EXTENSION)
}
