use std::fmt;
use std::io::Cursor;

use base64::Engine as _;
use bytes::Bytes;
use image::{ImageFormat, ImageReader, Limits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest edge accepted from a device camera.
const MAX_IMAGE_DIMENSION: u32 = 12_000;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("photo is empty")]
    Empty,

    #[error("photo too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported photo format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid photo dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("photo decode failed")]
    Decode(#[source] image::ImageError),

    #[error("photo read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoFormat {
    Jpeg,
    Png,
    Webp,
}

impl PhotoFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            PhotoFormat::Jpeg => "image/jpeg",
            PhotoFormat::Png => "image/png",
            PhotoFormat::Webp => "image/webp",
        }
    }

    fn from_image_format(format: ImageFormat) -> Result<Self, PhotoError> {
        match format {
            ImageFormat::Jpeg => Ok(PhotoFormat::Jpeg),
            ImageFormat::Png => Ok(PhotoFormat::Png),
            ImageFormat::WebP => Ok(PhotoFormat::Webp),
            other => Err(PhotoError::UnsupportedFormat(format!("{other:?}"))),
        }
    }
}

/// Encoded photo bytes exactly as captured. Never re-encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    format: PhotoFormat,
    bytes: Bytes,
    width: u32,
    height: u32,
}

impl Photo {
    /// Sniffs the container format and reads the header dimensions without
    /// decoding pixel data.
    pub fn from_bytes(data: impl Into<Bytes>, max_bytes: usize) -> Result<Self, PhotoError> {
        let bytes: Bytes = data.into();
        if bytes.is_empty() {
            return Err(PhotoError::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(PhotoError::TooLarge {
                size: bytes.len(),
                max: max_bytes,
            });
        }

        let guessed = image::guess_format(&bytes)
            .map_err(|_| PhotoError::UnsupportedFormat("unrecognized".into()))?;
        let format = PhotoFormat::from_image_format(guessed)?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
        limits.max_image_height = Some(MAX_IMAGE_DIMENSION);

        let mut reader = ImageReader::with_format(Cursor::new(&bytes[..]), guessed);
        reader.limits(limits);
        let (width, height) = reader.into_dimensions().map_err(PhotoError::Decode)?;

        if width == 0 || height == 0 {
            return Err(PhotoError::InvalidDimensions { width, height });
        }

        Ok(Self {
            format,
            bytes,
            width,
            height,
        })
    }

    pub fn format(&self) -> PhotoFormat {
        self.format
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// `data:<mime>;base64,<payload>` as the reports endpoint expects.
    pub fn data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{encoded}", self.format.mime_type())
    }

    pub fn checksum(&self) -> blake3::Hash {
        blake3::hash(&self.bytes)
    }
}

impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Photo")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
