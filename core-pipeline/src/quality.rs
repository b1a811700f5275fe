//! Payload quality gate.
//!
//! Cheap, deterministic checks run before any network call: the payload
//! must be non-empty, within the size limit, and start with a known image or
//! document signature. Rejections are never retried.

use crate::error::{PipelineError, Result};
use core_runtime::config::PipelineSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    Pdf,
}

impl PayloadFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            PayloadFormat::Jpeg => "image/jpeg",
            PayloadFormat::Png => "image/png",
            PayloadFormat::Gif => "image/gif",
            PayloadFormat::Webp => "image/webp",
            PayloadFormat::Heic => "image/heic",
            PayloadFormat::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PayloadFormat::Jpeg => "jpg",
            PayloadFormat::Png => "png",
            PayloadFormat::Gif => "gif",
            PayloadFormat::Webp => "webp",
            PayloadFormat::Heic => "heic",
            PayloadFormat::Pdf => "pdf",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, PayloadFormat::Pdf)
    }
}

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// ISO-BMFF brands used by HEIC/HEIF still images.
const HEIF_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

/// Identifies the payload by its leading bytes.
pub fn detect_format(payload: &[u8]) -> Option<PayloadFormat> {
    if payload.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(PayloadFormat::Jpeg);
    }
    if payload.starts_with(PNG_SIGNATURE) {
        return Some(PayloadFormat::Png);
    }
    if payload.starts_with(b"GIF87a") || payload.starts_with(b"GIF89a") {
        return Some(PayloadFormat::Gif);
    }
    if payload.len() >= 12 && &payload[0..4] == b"RIFF" && &payload[8..12] == b"WEBP" {
        return Some(PayloadFormat::Webp);
    }
    if payload.len() >= 12
        && &payload[4..8] == b"ftyp"
        && HEIF_BRANDS.iter().any(|brand| &payload[8..12] == brand.as_slice())
    {
        return Some(PayloadFormat::Heic);
    }
    if payload.starts_with(b"%PDF-") {
        return Some(PayloadFormat::Pdf);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    pub enabled: bool,
    pub max_payload_bytes: usize,
}

impl QualityGate {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            enabled: settings.enable_quality_gate,
            max_payload_bytes: settings.max_payload_bytes,
        }
    }

    /// Validates one payload.
    ///
    /// Returns the detected format, or `None` when the gate is disabled.
    pub fn check(&self, name: &str, payload: &[u8]) -> Result<Option<PayloadFormat>> {
        if !self.enabled {
            return Ok(None);
        }

        if payload.is_empty() {
            return Err(PipelineError::EmptyPayload {
                name: name.to_string(),
            });
        }

        if payload.len() > self.max_payload_bytes {
            return Err(PipelineError::PayloadTooLarge {
                name: name.to_string(),
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        detect_format(payload)
            .map(Some)
            .ok_or_else(|| PipelineError::InvalidFormat {
                name: name.to_string(),
            })
    }
}
