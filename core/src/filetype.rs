//! Image type sniffing from leading bytes.
//!
//! Browsers happily report a `.png` that is really a JPEG; the upstream
//! rejects mismatches, so uploads trust the magic bytes over the name.

/// How many leading bytes are inspected.
pub const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageKind {
    pub ext: &'static str,
    pub mime: &'static str,
}

const JPEG: ImageKind = ImageKind { ext: "jpg", mime: "image/jpeg" };
const PNG: ImageKind = ImageKind { ext: "png", mime: "image/png" };
const GIF: ImageKind = ImageKind { ext: "gif", mime: "image/gif" };
const BMP: ImageKind = ImageKind { ext: "bmp", mime: "image/bmp" };
const WEBP: ImageKind = ImageKind { ext: "webp", mime: "image/webp" };
const ICO: ImageKind = ImageKind { ext: "ico", mime: "image/x-icon" };
const TIFF: ImageKind = ImageKind { ext: "tiff", mime: "image/tiff" };
const AVIF: ImageKind = ImageKind { ext: "avif", mime: "image/avif" };
const SVG: ImageKind = ImageKind { ext: "svg", mime: "image/svg+xml" };

/// Identify the image format of `bytes`, or `None` if it is not one we accept.
pub fn detect(bytes: &[u8]) -> Option<ImageKind> {
    let h = &bytes[..bytes.len().min(SNIFF_LEN)];
    if h.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(JPEG);
    }
    if h.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return Some(PNG);
    }
    if h.starts_with(b"GIF87a") || h.starts_with(b"GIF89a") {
        return Some(GIF);
    }
    if h.starts_with(b"BM") {
        return Some(BMP);
    }
    if h.len() >= 12 && &h[0..4] == b"RIFF" && &h[8..12] == b"WEBP" {
        return Some(WEBP);
    }
    if h.len() >= 4 && h[0] == 0 && h[1] == 0 && matches!(h[2], 1 | 2) && h[3] == 0 {
        return Some(ICO);
    }
    if h.starts_with(&[b'I', b'I', 0x2a, 0x00]) || h.starts_with(&[b'M', b'M', 0x00, 0x2a]) {
        return Some(TIFF);
    }
    if h.len() >= 12 && &h[4..8] == b"ftyp" && matches!(&h[8..12], b"avif" | b"avis") {
        return Some(AVIF);
    }
    if is_svg(h) {
        return Some(SVG);
    }
    None
}

fn is_svg(h: &[u8]) -> bool {
    let text = String::from_utf8_lossy(h);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let head: String = text.chars().take(128).collect::<String>().to_lowercase();
    head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg"))
}

/// Replace the last extension of `name` with `ext`.
pub fn normalize_name(name: &str, ext: &str) -> String {
    let base = match name.rfind('.') {
        Some(dot) if !name[dot + 1..].is_empty() => &name[..dot],
        _ => name,
    };
    format!("{base}.{ext}")
}
