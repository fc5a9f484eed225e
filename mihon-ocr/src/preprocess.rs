use std::borrow::Cow;

use image::{DynamicImage, GenericImageView, RgbImage, imageops::FilterType};
use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::{OcrError, Result};

/// Channel-interleaved (R, G, B per pixel) square float image, ready for the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    side: u32,
}

impl ImageTensor {
    pub fn zeros(side: u32) -> Self {
        let side_len = side as usize;
        Self {
            data: vec![0.0; side_len * side_len * 3],
            side,
        }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    side: u32,
    scale: f32,
    offset: f32,
}

impl ImagePreprocessor {
    pub fn new(side: u32, mean: f32, std: f32) -> Self {
        Self {
            side,
            scale: 1.0 / (255.0 * std),
            offset: mean / std,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.image_size, config.image_mean, config.image_std)
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    /// Converts `image` to RGB8, resizes it to `side × side` with a triangle filter and
    /// maps every channel byte from `[0, 255]` onto `[-1, 1]` (for mean = std = 0.5).
    ///
    /// The caller's image is only read; conversions and resizes work on private copies.
    #[instrument(level = "debug", skip_all)]
    pub fn preprocess(&self, image: &DynamicImage) -> Result<ImageTensor> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(OcrError::InvalidInput(format!(
                "image has no pixels ({width}x{height})"
            )));
        }

        let rgb: Cow<'_, RgbImage> = match image {
            DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb),
            other => Cow::Owned(other.to_rgb8()),
        };
        let rgb = if rgb.dimensions() == (self.side, self.side) {
            rgb
        } else {
            Cow::Owned(image::imageops::resize(
                &*rgb,
                self.side,
                self.side,
                FilterType::Triangle,
            ))
        };

        let data = rgb
            .as_raw()
            .iter()
            .map(|&p| p as f32 * self.scale - self.offset)
            .collect::<Vec<_>>();
        debug_assert_eq!(data.len(), (self.side * self.side * 3) as usize);

        Ok(ImageTensor {
            data,
            side: self.side,
        })
    }
}
