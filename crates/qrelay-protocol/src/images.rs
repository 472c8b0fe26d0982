// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Inbound image validation shared by both dialect parsers.

use base64::Engine;
use thiserror::Error;

/// Decoded size ceiling per image (20 MiB).
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Media types the upstream accepts, keyed to their short format token.
const ACCEPTED: &[(&str, &str)] = &[
    ("image/jpeg", "jpeg"),
    ("image/jpg", "jpeg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
];

#[derive(Debug, Error, PartialEq)]
pub enum ImageError {
    #[error("不支持的图片类型: {0}")]
    UnsupportedMediaType(String),
    #[error("图片必须以 data: URI 提供")]
    NotDataUrl,
    #[error("图片 base64 数据无效")]
    InvalidBase64,
    #[error("图片超过 20 MiB 上限 (解码后 {0} 字节)")]
    TooLarge(usize),
}

/// Validate a `media_type` + base64 payload pair as supplied by the
/// Anthropic `source.type = "base64"` shape.  Returns the short format token
/// passed to the Amazon Q `images` field.
pub fn validate_image(media_type: &str, data: &str) -> Result<String, ImageError> {
    let format = ACCEPTED
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(media_type))
        .map(|(_, f)| f.to_string())
        .ok_or_else(|| ImageError::UnsupportedMediaType(media_type.to_string()))?;

    // Exact decoded size matters only near the cap; the base64 length bound
    // (3 bytes per 4 chars) rejects the obvious offenders without decoding.
    let upper_bound = data.len() / 4 * 3;
    if upper_bound > MAX_IMAGE_BYTES + 2 {
        return Err(ImageError::TooLarge(upper_bound));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|_| ImageError::InvalidBase64)?;
    if decoded.len() > MAX_IMAGE_BYTES {
        return Err(ImageError::TooLarge(decoded.len()));
    }
    Ok(format)
}

/// Split an OpenAI `image_url` into `(media_type, base64)`.  Only `data:`
/// URIs are accepted — the gateway never fetches remote URLs on behalf of
/// a client.
pub fn decode_data_url(url: &str) -> Result<(String, String), ImageError> {
    let rest = url.strip_prefix("data:").ok_or(ImageError::NotDataUrl)?;
    let (meta, b64) = rest.split_once(',').ok_or(ImageError::NotDataUrl)?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta);
    Ok((mime.to_string(), b64.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_PIXEL_PNG: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

    #[test]
    fn accepts_png() {
        assert_eq!(validate_image("image/png", ONE_PIXEL_PNG).unwrap(), "png");
    }

    #[test]
    fn jpg_alias_normalizes_to_jpeg() {
        assert_eq!(validate_image("image/jpg", ONE_PIXEL_PNG).unwrap(), "jpeg");
    }

    #[test]
    fn media_type_match_is_case_insensitive() {
        assert_eq!(validate_image("IMAGE/WebP", ONE_PIXEL_PNG).unwrap(), "webp");
    }

    #[test]
    fn rejects_svg() {
        assert_eq!(
            validate_image("image/svg+xml", ONE_PIXEL_PNG),
            Err(ImageError::UnsupportedMediaType("image/svg+xml".into()))
        );
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(
            validate_image("image/png", "!!not-base64!!"),
            Err(ImageError::InvalidBase64)
        );
    }

    #[test]
    fn rejects_oversized_image_without_decoding() {
        // 30 MiB of base64 'A' characters — the length bound alone rejects it.
        let big = "A".repeat(40 * 1024 * 1024);
        assert!(matches!(
            validate_image("image/png", &big),
            Err(ImageError::TooLarge(_))
        ));
    }

    #[test]
    fn data_url_parses_media_type_and_payload() {
        let (mime, b64) = decode_data_url("data:image/png;base64,QUJD").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(b64, "QUJD");
    }

    #[test]
    fn https_url_is_rejected() {
        assert_eq!(
            decode_data_url("https://example.com/cat.png"),
            Err(ImageError::NotDataUrl)
        );
    }

    #[test]
    fn data_url_without_comma_is_rejected() {
        assert_eq!(decode_data_url("data:image/png"), Err(ImageError::NotDataUrl));
    }
}
