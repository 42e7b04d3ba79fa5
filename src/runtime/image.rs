//! Image tiling and normalization for the vision encoder

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use tracing::debug;

use super::tensor::Tensor;
use crate::constants::vision::STRONG_ASPECT_RATIO;
use crate::error::{Error, Result};
use crate::models::VisionLayout;

/// Arrangement of square tiles covering an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: u32,
    pub cols: u32,
}

impl TileGrid {
    pub fn tiles(&self) -> usize {
        (self.rows * self.cols) as usize
    }
}

/// Grid for an image of the given size: 1×1 when it fits in one tile, a
/// single row or column for strongly wide or tall images, 2×2 otherwise
pub fn choose_grid(width: u32, height: u32, tile_size: u32) -> TileGrid {
    if width <= tile_size && height <= tile_size {
        return TileGrid { rows: 1, cols: 1 };
    }
    let aspect = width as f32 / height.max(1) as f32;
    if aspect >= STRONG_ASPECT_RATIO {
        TileGrid { rows: 1, cols: 2 }
    } else if aspect <= 1.0 / STRONG_ASPECT_RATIO {
        TileGrid { rows: 2, cols: 1 }
    } else {
        TileGrid { rows: 2, cols: 2 }
    }
}

/// Normalized tiles ready for the image embedder
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub grid: TileGrid,
    /// `[tiles, 3, tile, tile]`, row-major tile order
    pub pixel_values: Tensor,
}

/// Decode encoded image bytes and prepare them
pub fn preprocess(bytes: &[u8], layout: &VisionLayout) -> Result<PreparedImage> {
    let image = image::load_from_memory(bytes)?;
    preprocess_image(&image, layout)
}

pub fn preprocess_image(image: &DynamicImage, layout: &VisionLayout) -> Result<PreparedImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Multimodal("image has no pixels".to_string()));
    }
    let tile = layout.tile_size;
    let grid = choose_grid(image.width(), image.height(), tile);
    debug!(
        "Tiling {}x{} image as {}x{} grid",
        image.width(),
        image.height(),
        grid.rows,
        grid.cols
    );

    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, grid.cols * tile, grid.rows * tile, FilterType::Triangle);

    let tile_len = 3 * (tile * tile) as usize;
    let mut data = Vec::with_capacity(grid.tiles() * tile_len);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let patch = imageops::crop_imm(&resized, col * tile, row * tile, tile, tile).to_image();
            normalize_into(&patch, layout, &mut data);
        }
    }

    let pixel_values = Tensor::from_f32(
        vec![grid.tiles(), 3, tile as usize, tile as usize],
        data,
    )?;
    Ok(PreparedImage { grid, pixel_values })
}

/// Append the tile as planar CHW floats, `(x / 255 - mean) / std` per channel
fn normalize_into(patch: &RgbImage, layout: &VisionLayout, out: &mut Vec<f32>) {
    for channel in 0..3 {
        let mean = layout.mean[channel];
        let std = layout.std[channel];
        out.extend(
            patch
                .pixels()
                .map(|p| (p.0[channel] as f32 / 255.0 - mean) / std),
        );
    }
}
