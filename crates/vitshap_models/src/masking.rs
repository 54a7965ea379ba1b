//! Mask injection primitives.
//!
//! Pure tensor functions shared by the backbones. None of them mutate their
//! inputs; every function returns a new tensor.

use burn::prelude::*;
use burn::tensor::Distribution;
use vitshap_core::{CoreError, PatchGrid, Result, DEFAULT_NUM_PLAYERS};

/// Magnitude of the additive attention bias for removed players.
pub const ATTENTION_MASK_BIAS: f32 = 1e4;

/// Broadcast a `[batch, num_players]` mask to a `[batch, height, width]` pixel mask.
///
/// Player `(i, j)` covers the block `[i * p, (i + 1) * p) x [j * p, (j + 1) * p)`
/// where `p` is the grid's patch size.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the mask width differs from the
/// number of grid cells.
pub fn upsample_player_mask<B: Backend>(mask: Tensor<B, 2>, grid: PatchGrid) -> Result<Tensor<B, 3>> {
    let [batch, players] = mask.dims();
    if players != grid.num_players() {
        return Err(CoreError::ShapeMismatch(format!(
            "mask has {} players, grid {}x{} has {}",
            players,
            grid.rows(),
            grid.cols(),
            grid.num_players()
        )));
    }
    let p = grid.patch_size();
    let (height, width) = grid.image_hw();

    Ok(mask
        .reshape([batch, grid.rows(), 1, grid.cols(), 1])
        .repeat_dim(2, p)
        .repeat_dim(4, p)
        .reshape([batch, height, width]))
}

/// Zero the pixels of removed players, scaling every channel by the player's mask value.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the image does not match the grid
/// or the mask width does not match the player count.
pub fn apply_zero_input<B: Backend>(
    images: Tensor<B, 4>,
    mask: Tensor<B, 2>,
    grid: PatchGrid,
) -> Result<Tensor<B, 4>> {
    let [batch, channels, height, width] = images.dims();
    if (height, width) != grid.image_hw() {
        return Err(CoreError::ShapeMismatch(format!(
            "image is {}x{}, player grid covers {}x{}",
            height,
            width,
            grid.image_hw().0,
            grid.image_hw().1
        )));
    }
    if mask.dims()[0] != batch {
        return Err(CoreError::ShapeMismatch(format!(
            "mask batch {} != image batch {}",
            mask.dims()[0],
            batch
        )));
    }
    let pixels = upsample_player_mask(mask, grid)?
        .unsqueeze_dim::<4>(1)
        .repeat_dim(1, channels);
    Ok(images * pixels)
}

/// Zero-input masking for convolutional backbones.
///
/// Only 224x224 images with 196 players on a 14x14 grid of 16 px cells are
/// accepted.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] for any other image size or player count.
pub fn convnet_zero_input<B: Backend>(images: Tensor<B, 4>, mask: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
    let grid = PatchGrid::convnet_default();
    let [_, _, height, width] = images.dims();
    let [_, players] = mask.dims();
    if (height, width) != grid.image_hw() || players != DEFAULT_NUM_PLAYERS {
        return Err(CoreError::ShapeMismatch(format!(
            "convnet zero-input masking requires 224x224 images and {} players, got {}x{} images and {} players",
            DEFAULT_NUM_PLAYERS, height, width, players
        )));
    }
    apply_zero_input(images, mask, grid)
}

/// Multiply `[batch, num_players, dim]` patch embeddings by the mask.
pub fn zero_embeddings<B: Backend>(tokens: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 3> {
    let [_, _, dim] = tokens.dims();
    tokens * mask.unsqueeze_dim::<3>(2).repeat_dim(2, dim)
}

/// Draw a 0/1 mask keeping each player with probability equal to its mask value.
///
/// A fresh sample is drawn on every call.
pub fn sample_players<B: Backend>(mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let uniform = Tensor::<B, 2>::random(mask.dims(), Distribution::Uniform(0.0, 1.0), &mask.device());
    uniform.lower(mask).float()
}

/// Prepend a column of ones for the class token.
pub fn with_class_token<B: Backend>(mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, _] = mask.dims();
    let ones = Tensor::<B, 2>::ones([batch, 1], &mask.device());
    Tensor::cat(vec![ones, mask], 1)
}

/// Additive bias `-(1 - m) * 1e4` over attention keys, shaped `[batch, 1, 1, keys]`.
pub fn attention_bias<B: Backend>(mask: Tensor<B, 2>) -> Tensor<B, 4> {
    let [batch, keys] = mask.dims();
    ((mask - 1.0) * ATTENTION_MASK_BIAS).reshape([batch, 1, 1, keys])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_upsample_all_ones() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 2>::ones([1, 196], &device);
        let pixels = upsample_player_mask(mask, PatchGrid::convnet_default()).unwrap();
        assert_eq!(pixels.dims(), [1, 224, 224]);
        assert!(values(pixels).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_upsample_single_cell_zeroes_its_block() {
        let device = Default::default();
        let grid = PatchGrid::convnet_default();
        // Player 17 is row 1, column 3.
        let mut rows = vec![1.0f32; 196];
        rows[17] = 0.0;
        let mask = Tensor::<TestBackend, 1>::from_floats(rows.as_slice(), &device).reshape([1, 196]);
        let pixels = values(upsample_player_mask(mask, grid).unwrap());

        for y in 0..224 {
            for x in 0..224 {
                let inside = (16..32).contains(&y) && (48..64).contains(&x);
                let expected = if inside { 0.0 } else { 1.0 };
                assert_eq!(pixels[y * 224 + x], expected, "pixel ({}, {})", y, x);
                assert_eq!(grid.player_at(y, x) == Some(17), inside);
            }
        }
    }

    #[test]
    fn test_upsample_rejects_wrong_width() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 2>::ones([1, 195], &device);
        assert!(matches!(
            upsample_player_mask(mask, PatchGrid::convnet_default()),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_apply_zero_input_scales_every_channel() {
        let device = Default::default();
        let grid = PatchGrid::new(2, 2, 2);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device);
        let mask = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 0.5, 1.0], &device).reshape([1, 4]);
        let out = apply_zero_input(images, mask, grid).unwrap();
        assert_eq!(out.dims(), [1, 3, 4, 4]);

        let out = values(out);
        for c in 0..3 {
            let plane = &out[c * 16..(c + 1) * 16];
            assert_eq!(plane[0], 1.0);
            assert_eq!(plane[3], 0.0);
            assert_eq!(plane[8], 0.5);
            assert_eq!(plane[15], 1.0);
        }
    }

    #[test]
    fn test_convnet_zero_input_requires_224() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 112, 112], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 196], &device);
        assert!(matches!(
            convnet_zero_input(images, mask),
            Err(CoreError::ShapeMismatch(_))
        ));

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 224, 224], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 49], &device);
        assert!(matches!(
            convnet_zero_input(images, mask),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_sample_players_extremes() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 1.0, 0.0], &device).reshape([2, 2]);
        let sampled = values(sample_players(mask));
        assert_eq!(sampled, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_attention_bias() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device).reshape([1, 2]);
        let bias = with_class_token(mask);
        assert_eq!(values(bias.clone()), vec![1.0, 1.0, 0.0]);
        let bias = attention_bias(bias);
        assert_eq!(bias.dims(), [1, 1, 1, 3]);
        assert_eq!(values(bias), vec![0.0, 0.0, -ATTENTION_MASK_BIAS]);
    }

    #[test]
    fn test_zero_embeddings() {
        let device = Default::default();
        let tokens = Tensor::<TestBackend, 3>::ones([1, 2, 3], &device);
        let mask = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device).reshape([1, 2]);
        let out = values(zero_embeddings(tokens, mask));
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
