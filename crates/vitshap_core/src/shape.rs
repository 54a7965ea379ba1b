//! Image and player geometry.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Player count used when a backbone has no patch embedding.
pub const DEFAULT_NUM_PLAYERS: usize = 196;

/// Shape metadata for image batches in `(B, C, H, W)` layout.
///
/// # Example
///
/// ```rust
/// use vitshap_core::ImageShape;
///
/// let shape = ImageShape::from_dims([8, 3, 224, 224]);
/// assert_eq!(shape.batch(), 8);
/// assert_eq!(shape.hw(), (224, 224));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageShape {
    /// Create a new image shape.
    #[must_use]
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Create from the dims of a rank-4 tensor.
    #[must_use]
    pub const fn from_dims(dims: [usize; 4]) -> Self {
        Self::new(dims[0], dims[1], dims[2], dims[3])
    }

    /// Batch size.
    #[must_use]
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Number of color channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// `(height, width)` in pixels.
    #[must_use]
    pub const fn hw(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Dims as an array.
    #[must_use]
    pub const fn as_array(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }
}

/// A grid of square patches, one player per patch.
///
/// Players are numbered row-major: player `i * cols + j` covers the pixel
/// block `[i * patch_size, (i + 1) * patch_size) x [j * patch_size, (j + 1) * patch_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchGrid {
    rows: usize,
    cols: usize,
    patch_size: usize,
}

impl PatchGrid {
    /// Create a grid of `rows x cols` patches of `patch_size` pixels.
    #[must_use]
    pub const fn new(rows: usize, cols: usize, patch_size: usize) -> Self {
        Self {
            rows,
            cols,
            patch_size,
        }
    }

    /// The only grid convnet zero-input masking knows: 14x14 players of 16 px on 224x224 images.
    #[must_use]
    pub const fn convnet_default() -> Self {
        Self::new(14, 14, 16)
    }

    /// Tile an image of `height x width` pixels with patches of `patch_size`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] when the image is not an exact
    /// multiple of the patch size.
    pub fn for_image(height: usize, width: usize, patch_size: usize) -> Result<Self> {
        if patch_size == 0 || height % patch_size != 0 || width % patch_size != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "image {}x{} cannot be tiled by {}px patches",
                height, width, patch_size
            )));
        }
        Ok(Self::new(height / patch_size, width / patch_size, patch_size))
    }

    /// Number of patch rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of patch columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Patch edge length in pixels.
    #[must_use]
    pub const fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Number of players on the grid.
    #[must_use]
    pub const fn num_players(&self) -> usize {
        self.rows * self.cols
    }

    /// Pixel `(height, width)` covered by the grid.
    #[must_use]
    pub const fn image_hw(&self) -> (usize, usize) {
        (self.rows * self.patch_size, self.cols * self.patch_size)
    }

    /// Player index covering pixel `(y, x)`, if inside the grid.
    #[must_use]
    pub fn player_at(&self, y: usize, x: usize) -> Option<usize> {
        let (h, w) = self.image_hw();
        if y >= h || x >= w {
            return None;
        }
        Some((y / self.patch_size) * self.cols + x / self.patch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convnet_default_grid() {
        let grid = PatchGrid::convnet_default();
        assert_eq!(grid.num_players(), DEFAULT_NUM_PLAYERS);
        assert_eq!(grid.image_hw(), (224, 224));
    }

    #[test]
    fn test_for_image() {
        let grid = PatchGrid::for_image(224, 224, 32).unwrap();
        assert_eq!(grid.num_players(), 49);
        assert!(PatchGrid::for_image(224, 224, 30).is_err());
        assert!(PatchGrid::for_image(224, 224, 0).is_err());
    }

    #[test]
    fn test_player_at_row_major() {
        let grid = PatchGrid::new(14, 14, 16);
        assert_eq!(grid.player_at(0, 0), Some(0));
        assert_eq!(grid.player_at(15, 15), Some(0));
        assert_eq!(grid.player_at(0, 16), Some(1));
        assert_eq!(grid.player_at(16, 0), Some(14));
        assert_eq!(grid.player_at(223, 223), Some(195));
        assert_eq!(grid.player_at(224, 0), None);
    }
}
