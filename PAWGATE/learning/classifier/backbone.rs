use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::preprocess::ImageTensor;

/// Frozen feature extractor: pooled colour grid, channel moments and
/// per-channel intensity histograms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PooledColourBackbone {
    /// Grid cells per side used for average pooling.
    pub grid: usize,
    /// Histogram bins per channel.
    pub bins: usize,
}

impl Default for PooledColourBackbone {
    fn default() -> Self {
        Self { grid: 4, bins: 8 }
    }
}

impl PooledColourBackbone {
    /// Length of the produced feature vector.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.grid * self.grid * 3 + 6 + self.bins * 3
    }

    /// Extracts features from a normalised image.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn extract(&self, image: &ImageTensor) -> Array1<f32> {
        let data = image.data();
        let (height, width, _) = data.dim();
        let grid = self.grid.max(1);
        let bins = self.bins.max(1);
        let mut features = Vec::with_capacity(self.dim());

        for gy in 0..grid {
            let (y0, y1) = cell_bounds(gy, grid, height);
            for gx in 0..grid {
                let (x0, x1) = cell_bounds(gx, grid, width);
                let count = ((y1 - y0) * (x1 - x0)) as f32;
                for c in 0..3 {
                    let mut sum = 0.0;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            sum += data[[y, x, c]];
                        }
                    }
                    features.push(if count > 0.0 { sum / count } else { 0.0 });
                }
            }
        }

        let pixels = (height * width).max(1) as f32;
        let mut histogram = vec![0.0_f32; bins * 3];
        let mut means = [0.0_f32; 3];
        let mut squares = [0.0_f32; 3];
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    let v = data[[y, x, c]];
                    means[c] += v;
                    squares[c] += v * v;
                    let bin = ((v.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1);
                    histogram[c * bins + bin] += 1.0;
                }
            }
        }
        for c in 0..3 {
            let mean = means[c] / pixels;
            let variance = (squares[c] / pixels - mean * mean).max(0.0);
            features.push(mean);
            features.push(variance.sqrt());
        }
        features.extend(histogram.into_iter().map(|h| h / pixels));
        Array1::from(features)
    }
}

fn cell_bounds(index: usize, cells: usize, extent: usize) -> (usize, usize) {
    let start = index * extent / cells;
    let end = ((index + 1) * extent / cells).max(start);
    (start, end.min(extent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn feature_length_matches_dim() {
        let backbone = PooledColourBackbone::default();
        let image = ImageTensor::from_array(Array3::from_elem((16, 16, 3), 0.5));
        assert_eq!(backbone.extract(&image).len(), backbone.dim());
    }

    #[test]
    fn solid_image_has_flat_grid_and_single_histogram_bin() {
        let backbone = PooledColourBackbone { grid: 2, bins: 4 };
        let image = ImageTensor::from_array(Array3::from_elem((8, 8, 3), 0.3));
        let features = backbone.extract(&image);
        for value in features.iter().take(12) {
            assert!((value - 0.3).abs() < 1e-5);
        }
        // mean/std pairs then histograms
        assert!((features[12] - 0.3).abs() < 1e-5);
        assert!(features[13].abs() < 1e-3);
        let red_hist = &features.as_slice().unwrap()[18..22];
        assert!((red_hist[1] - 1.0).abs() < 1e-5);
        assert!((red_hist.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn tiny_images_do_not_panic() {
        let backbone = PooledColourBackbone::default();
        let image = ImageTensor::from_array(Array3::from_elem((1, 2, 3), 1.0));
        let features = backbone.extract(&image);
        assert!(features.iter().all(|v| v.is_finite()));
    }
}
