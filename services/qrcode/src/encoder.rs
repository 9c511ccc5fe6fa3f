//! QR image encoding.
//!
//! Module placement comes from the `qrcode` crate; this module only rasterizes
//! the module grid into a grayscale PNG with a quiet zone and a fixed scale.

use crate::config::{EncoderConfig, ErrorCorrection};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use qrcode::types::QrError;
use qrcode::{Color, EcLevel, QrCode};
use std::io::Cursor;
use thiserror::Error;

/// Errors that can occur while rendering a QR image
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Data too long to fit in a QR code")]
    DataTooLong,

    #[error("Failed to build QR code: {0}")]
    Qr(String),

    #[error("QR image of {modules} modules at scale {scale} is too large")]
    TooLarge { modules: usize, scale: u32 },

    #[error("Failed to encode PNG: {0}")]
    Png(#[from] image::ImageError),
}

impl From<QrError> for EncodeError {
    fn from(e: QrError) -> Self {
        match e {
            QrError::DataTooLong => EncodeError::DataTooLong,
            other => EncodeError::Qr(other.to_string()),
        }
    }
}

/// Renders text into image bytes
#[cfg_attr(test, mockall::automock)]
pub trait ImageEncoder: Send + Sync {
    /// Encode `text` into a PNG
    fn encode(&self, text: &str) -> Result<Vec<u8>, EncodeError>;
}

impl From<ErrorCorrection> for EcLevel {
    fn from(level: ErrorCorrection) -> Self {
        match level {
            ErrorCorrection::Low => EcLevel::L,
            ErrorCorrection::Medium => EcLevel::M,
            ErrorCorrection::Quartile => EcLevel::Q,
            ErrorCorrection::High => EcLevel::H,
        }
    }
}

/// PNG encoder for QR codes: black modules on white
#[derive(Debug, Clone)]
pub struct QrPngEncoder {
    ec_level: EcLevel,
    margin: u32,
    scale: u32,
}

impl QrPngEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            ec_level: config.error_correction.into(),
            margin: config.margin,
            // A zero scale would produce an empty image
            scale: config.scale.max(1),
        }
    }

    /// Build the grayscale raster for `text`
    pub fn render(&self, text: &str) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>, EncodeError> {
        let code = QrCode::with_error_correction_level(text.as_bytes(), self.ec_level)?;
        let modules = code.width();
        let colors = code.to_colors();

        let too_large = || EncodeError::TooLarge {
            modules,
            scale: self.scale,
        };
        let side_modules = u32::try_from(modules)
            .ok()
            .and_then(|m| m.checked_add(self.margin.checked_mul(2)?))
            .ok_or_else(too_large)?;
        let side = side_modules.checked_mul(self.scale).ok_or_else(too_large)?;

        let margin = self.margin;
        let scale = self.scale;
        let img = ImageBuffer::from_fn(side, side, |x, y| {
            let mx = (x / scale) as i64 - margin as i64;
            let my = (y / scale) as i64 - margin as i64;
            let inside = (0..modules as i64).contains(&mx) && (0..modules as i64).contains(&my);
            if inside && colors[my as usize * modules + mx as usize] == Color::Dark {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        });

        Ok(img)
    }
}

impl Default for QrPngEncoder {
    fn default() -> Self {
        Self::new(&EncoderConfig::default())
    }
}

impl ImageEncoder for QrPngEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u8>, EncodeError> {
        let img = self.render(text)?;

        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

        Ok(bytes)
    }
}
