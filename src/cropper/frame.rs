//! Source frame model
//!
//! Frames are packed-pixel with an explicit stride; croppers only ever read
//! them. Payloads are `Bytes`, so the one captured frame is shared by all
//! croppers without copying.

use std::time::Instant;

use bytes::Bytes;

use crate::error::{AppError, Result};

/// Packed pixel format of source frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgba => write!(f, "RGBA"),
            PixelFormat::Bgra => write!(f, "BGRA"),
        }
    }
}

/// A captured source frame
#[derive(Debug, Clone)]
pub struct SourceFrame {
    data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Bytes per row; at least `width * bytes_per_pixel`.
    pub stride: u32,
    pub format: PixelFormat,
    /// Monotonic capture sequence number, used to drop duplicates.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl SourceFrame {
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        let min_stride = width
            .checked_mul(format.bytes_per_pixel())
            .ok_or_else(|| AppError::BadInput("frame width overflows stride".to_string()))?;
        if stride < min_stride {
            return Err(AppError::BadInput(format!(
                "stride {} too small for {} pixels of {}",
                stride, width, format
            )));
        }
        let required = stride as usize * height as usize;
        if data.len() < required {
            return Err(AppError::BadInput(format!(
                "frame payload {} bytes, need {} for {}x{} stride {}",
                data.len(),
                required,
                width,
                height,
                stride
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
            format,
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// Tightly packed frame: stride equals `width * bytes_per_pixel`.
    pub fn packed(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        let stride = width * format.bytes_per_pixel();
        Self::new(data, width, height, stride, format, sequence)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }
}
