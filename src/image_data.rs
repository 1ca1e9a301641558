use std::path::Path;

use image::{imageops, DynamicImage};

use crate::error::Result;

/// Fixed-shape patch encoding of one image.
///
/// `patches` holds `max_patches` rows of `patch_dim` values each. Every row
/// starts with the 1-based row and column id of the patch followed by its
/// standardized RGB pixels. Rows past the real patch count are zero.
#[derive(Debug, Clone)]
pub struct FlattenedPatches {
    pub patches: Vec<f32>,
    pub attention_mask: Vec<f32>,
    pub max_patches: usize,
    pub patch_dim: usize,
}

impl FlattenedPatches {
    pub fn num_real_patches(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m > 0.0).count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PatchExtractor {
    patch_height: u32,
    patch_width: u32,
    max_patches: usize,
}

impl PatchExtractor {
    pub fn new(max_patches: usize) -> Self {
        Self {
            patch_height: 16,
            patch_width: 16,
            max_patches,
        }
    }

    /// Number of pixel values in one patch.
    pub fn patch_input_size(&self) -> usize {
        (self.patch_height * self.patch_width * 3) as usize
    }

    /// Pixel values plus the row and column ids.
    pub fn patch_dim(&self) -> usize {
        self.patch_input_size() + 2
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<FlattenedPatches> {
        let img = image::open(path)?;

        Ok(self.extract(&img))
    }

    /// Returns the `(rows, cols)` patch grid an image of the given size is
    /// resized to so that `rows * cols <= max_patches`.
    pub fn grid(&self, height: u32, width: u32) -> (usize, usize) {
        let (ph, pw) = (self.patch_height as f64, self.patch_width as f64);
        let (h, w) = (height.max(1) as f64, width.max(1) as f64);
        let scale = (self.max_patches as f64 * (ph / h) * (pw / w)).sqrt();
        let rows = ((scale * h / ph).floor() as usize).clamp(1, self.max_patches);
        let cols = ((scale * w / pw).floor() as usize).clamp(1, self.max_patches);

        (rows, cols)
    }

    pub fn extract(&self, img: &DynamicImage) -> FlattenedPatches {
        let rgb = img.to_rgb32f();
        let (rows, cols) = self.grid(rgb.height(), rgb.width());

        // standardization statistics come from the image before resizing
        let raw = rgb.as_raw();
        let n = raw.len() as f64;
        let mean = raw.iter().map(|&v| v as f64 * 255.0).sum::<f64>() / n;
        let var = raw
            .iter()
            .map(|&v| (v as f64 * 255.0 - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = var.sqrt().max(1.0 / n.sqrt());

        let resized = imageops::resize(
            &rgb,
            cols as u32 * self.patch_width,
            rows as u32 * self.patch_height,
            imageops::FilterType::Triangle,
        );

        let patch_dim = self.patch_dim();
        let mut patches = Vec::with_capacity(self.max_patches * patch_dim);
        for row in 0..rows as u32 {
            for col in 0..cols as u32 {
                patches.push((row + 1) as f32);
                patches.push((col + 1) as f32);
                for y in 0..self.patch_height {
                    for x in 0..self.patch_width {
                        let pixel = resized.get_pixel(
                            col * self.patch_width + x,
                            row * self.patch_height + y,
                        );
                        patches.extend(
                            pixel.0.iter().map(|&v| ((v as f64 * 255.0 - mean) / std) as f32),
                        );
                    }
                }
            }
        }
        debug_assert!(rows * cols <= self.max_patches);
        patches.resize(self.max_patches * patch_dim, 0.0);

        let mut attention_mask = vec![1.0; rows * cols];
        attention_mask.resize(self.max_patches, 0.0);

        FlattenedPatches {
            patches,
            attention_mask,
            max_patches: self.max_patches,
            patch_dim,
        }
    }
}

#[cfg(test)]
mod test {
    use image::{Rgb, RgbImage};

    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn test_grid_fills_budget() {
        let extractor = PatchExtractor::new(8);

        assert_eq!(extractor.grid(32, 64), (2, 4));
        assert_eq!(PatchExtractor::new(16).grid(32, 64), (2, 5));
    }

    #[test]
    fn test_grid_thin_image() {
        let extractor = PatchExtractor::new(16);
        let (rows, cols) = extractor.grid(2, 4000);

        assert_eq!(rows, 1);
        assert!(rows * cols <= 16);
    }

    #[test]
    fn test_extract_shape_and_mask() {
        let extractor = PatchExtractor::new(16);
        let encoded = extractor.extract(&gradient(64, 32));

        assert_eq!(encoded.patch_dim, 770);
        assert_eq!(encoded.patches.len(), 16 * 770);
        assert_eq!(encoded.attention_mask.len(), 16);
        assert_eq!(encoded.num_real_patches(), 10);
        assert!(encoded.attention_mask[10..].iter().all(|&m| m == 0.0));
        assert!(encoded.patches[10 * 770..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_extract_row_col_ids() {
        let extractor = PatchExtractor::new(16);
        let encoded = extractor.extract(&gradient(64, 32));
        let patch = |i: usize| &encoded.patches[i * 770..(i + 1) * 770];

        // 2 rows x 5 cols
        assert_eq!(&patch(0)[..2], &[1.0, 1.0]);
        assert_eq!(&patch(4)[..2], &[1.0, 5.0]);
        assert_eq!(&patch(5)[..2], &[2.0, 1.0]);
        assert_eq!(&patch(9)[..2], &[2.0, 5.0]);
    }

    #[test]
    fn test_extract_standardizes_pixels() {
        let extractor = PatchExtractor::new(8);
        let encoded = extractor.extract(&gradient(64, 32));
        let pixels: Vec<f32> = encoded
            .patches
            .chunks(encoded.patch_dim)
            .take(encoded.num_real_patches())
            .flat_map(|patch| patch[2..].to_vec())
            .collect();
        let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;

        assert!(mean.abs() < 1e-3);
    }

    #[test]
    fn test_extract_uses_source_statistics() {
        // 2x downscale blends the checkerboard into flat mid gray
        let extractor = PatchExtractor::new(4);
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let v = if (x + y) % 2 == 0 { 0 } else { 255 };
            Rgb([v, v, v])
        }));
        let encoded = extractor.extract(&img);

        assert_eq!(encoded.num_real_patches(), 4);
        let pixels = encoded
            .patches
            .chunks(encoded.patch_dim)
            .take(4)
            .flat_map(|patch| patch[2..].to_vec());
        for v in pixels {
            assert!(v.abs() < 0.1, "{v}");
        }
    }

    #[test]
    fn test_extract_constant_image() {
        let extractor = PatchExtractor::new(4);
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([200, 200, 200])));
        let encoded = extractor.extract(&img);

        assert!(encoded.patches.iter().all(|v| v.is_finite()));
    }
}
