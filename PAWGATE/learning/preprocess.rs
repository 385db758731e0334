//! Image decoding, resizing and normalisation.

use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::errors::LearningResult;

/// Default model input edge length in pixels.
pub const DEFAULT_IMAGE_SIZE: u32 = 224;

/// File extensions recognised as images inside dataset directories.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Returns true when `path` carries one of [`IMAGE_EXTENSIONS`] (case-insensitive).
#[must_use]
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Normalised RGB image, laid out as `(height, width, channel)` with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array3<f32>,
}

impl ImageTensor {
    /// Wraps an existing `(h, w, 3)` array.
    #[must_use]
    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Builds a tensor from an 8-bit RGB image without resizing.
    #[must_use]
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let data = Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
            f32::from(image.get_pixel(x as u32, y as u32)[c]) / 255.0
        });
        Self { data }
    }

    /// Image height.
    #[must_use]
    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    /// Image width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    /// Underlying array.
    #[must_use]
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Mirror image along the vertical axis.
    #[must_use]
    pub fn flipped_horizontally(&self) -> Self {
        let width = self.width();
        let data = Array3::from_shape_fn(self.data.dim(), |(y, x, c)| {
            self.data[[y, width - 1 - x, c]]
        });
        Self { data }
    }
}

/// Decodes uploads and training files into model-ready tensors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preprocessor {
    /// Target width.
    pub width: u32,
    /// Target height.
    pub height: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::square(DEFAULT_IMAGE_SIZE)
    }
}

impl Preprocessor {
    /// Square target size.
    #[must_use]
    pub const fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    /// Decodes raw bytes into RGB, dropping alpha and expanding greyscale.
    pub fn decode(bytes: &[u8]) -> LearningResult<RgbImage> {
        Ok(image::load_from_memory(bytes)?.to_rgb8())
    }

    /// Resizes and normalises an already decoded image.
    #[must_use]
    pub fn tensor_from_rgb(&self, image: &RgbImage) -> ImageTensor {
        if image.dimensions() == (self.width, self.height) {
            return ImageTensor::from_rgb(image);
        }
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        ImageTensor::from_rgb(&resized)
    }

    /// Decode + resize + normalise raw upload bytes.
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> LearningResult<ImageTensor> {
        let rgb = Self::decode(bytes)?;
        Ok(self.tensor_from_rgb(&rgb))
    }

    /// Decode + resize + normalise an image file.
    pub fn preprocess_path(&self, path: impl AsRef<Path>) -> LearningResult<ImageTensor> {
        let rgb = image::open(path.as_ref())?.to_rgb8();
        Ok(self.tensor_from_rgb(&rgb))
    }

    /// Returns true if the file decodes as an image.
    #[must_use]
    pub fn validate_image(path: impl AsRef<Path>) -> bool {
        image::open(path.as_ref()).is_ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb(rgb));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn preprocess_resizes_and_normalises() {
        let bytes = solid_png(40, 20, [255, 0, 51]);
        let tensor = Preprocessor::square(8).preprocess_bytes(&bytes).unwrap();
        assert_eq!(tensor.height(), 8);
        assert_eq!(tensor.width(), 8);
        let px = tensor.data()[[3, 3, 0]];
        assert!((px - 1.0).abs() < 1e-6);
        assert!((tensor.data()[[3, 3, 2]] - 0.2).abs() < 1e-3);
    }

    #[test]
    fn rgba_input_drops_alpha() {
        let image = RgbaImage::from_pixel(4, 4, image::Rgba([0, 255, 0, 10]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        let tensor = Preprocessor::square(4)
            .preprocess_bytes(&bytes.into_inner())
            .unwrap();
        assert_eq!(tensor.data().dim(), (4, 4, 3));
        assert!((tensor.data()[[0, 0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Preprocessor::default()
            .preprocess_bytes(b"definitely not an image")
            .is_err());
    }

    #[test]
    fn horizontal_flip_mirrors_columns() {
        let mut image = RgbImage::from_pixel(3, 1, Rgb([0, 0, 0]));
        image.put_pixel(0, 0, Rgb([255, 255, 255]));
        let tensor = ImageTensor::from_rgb(&image);
        let flipped = tensor.flipped_horizontally();
        assert!((flipped.data()[[0, 2, 0]] - 1.0).abs() < 1e-6);
        assert!(flipped.data()[[0, 0, 0]].abs() < 1e-6);
    }

    #[test]
    fn recognises_extensions_case_insensitively() {
        assert!(has_image_extension(Path::new("a/b/cat.JPG")));
        assert!(has_image_extension(Path::new("dog.png")));
        assert!(!has_image_extension(Path::new("notes.txt")));
        assert!(!has_image_extension(Path::new("noext")));
    }
}
