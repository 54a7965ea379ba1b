//! Vision Transformer with mask injection.
//!
//! Based on "An Image is Worth 16x16 Words: Transformers for Image Recognition
//! at Scale" by Dosovitskiy et al. (2021), laid out like timm's
//! `VisionTransformer` so parameter names line up with timm checkpoints.
//!
//! ```text
//! Input (B, C, H, W)
//!       |
//!       +---> [zero-input: pixels x upsampled mask]
//!       |
//!       +---> [Patch Embedding (Conv p x p, stride p)] -> (B, N, D)
//!       |
//!       +---> [zero-embedding: tokens x mask]
//!       |
//!       +---> [cat cls token] + [pos_embed] -> (B, N + 1, D)
//!       |
//!       +---> [Block x depth]  (pre-/post-softmax key masks inside attention)
//!       |
//!       +---> [LayerNorm] -> cls (B, D), tokens (B, N, D)
//!       |
//!       +---> [Linear head] (optional)
//! ```

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{
    Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};
use vitshap_core::{CoreError, MaskLocation, PatchGrid, Result};

use crate::masking::{
    apply_zero_input, attention_bias, sample_players, with_class_token, zero_embeddings,
};
use crate::state_dict::{join, NamedParameters, ParamMapper};

/// Configuration for [`VisionTransformer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionTransformerConfig {
    /// Input image edge length in pixels.
    pub img_size: usize,
    /// Patch edge length in pixels.
    pub patch_size: usize,
    /// Number of input channels.
    pub in_chans: usize,
    /// Classes of the native head; 0 builds no head.
    pub num_classes: usize,
    /// Token width.
    pub embed_dim: usize,
    /// Number of encoder blocks.
    pub depth: usize,
    /// Attention heads per block.
    pub num_heads: usize,
    /// Hidden width of the MLP relative to `embed_dim`.
    pub mlp_ratio: f64,
    /// Whether the qkv projection has a bias.
    pub qkv_bias: bool,
    /// Dropout rate after position embedding, attention and MLP.
    pub drop_rate: f64,
    /// Layer-norm epsilon.
    pub layer_norm_eps: f64,
}

impl Default for VisionTransformerConfig {
    fn default() -> Self {
        Self::vit_base_patch16_224()
    }
}

impl VisionTransformerConfig {
    fn preset(patch_size: usize, embed_dim: usize, depth: usize, num_heads: usize) -> Self {
        Self {
            img_size: 224,
            patch_size,
            in_chans: 3,
            num_classes: 1000,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            qkv_bias: true,
            drop_rate: 0.0,
            layer_norm_eps: 1e-6,
        }
    }

    /// ViT-Ti/16.
    pub fn vit_tiny_patch16_224() -> Self {
        Self::preset(16, 192, 12, 3)
    }

    /// ViT-S/16.
    pub fn vit_small_patch16_224() -> Self {
        Self::preset(16, 384, 12, 6)
    }

    /// ViT-B/16.
    pub fn vit_base_patch16_224() -> Self {
        Self::preset(16, 768, 12, 12)
    }

    /// ViT-L/16.
    pub fn vit_large_patch16_224() -> Self {
        Self::preset(16, 1024, 24, 16)
    }

    /// ViT-B/32.
    pub fn vit_base_patch32_224() -> Self {
        Self::preset(32, 768, 12, 12)
    }

    /// Set the number of native classes.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Patch grid implied by `img_size` and `patch_size`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] when the image is not tiled exactly.
    pub fn grid(&self) -> Result<PatchGrid> {
        PatchGrid::for_image(self.img_size, self.img_size, self.patch_size)
    }

    /// Number of players (patches).
    pub fn num_patches(&self) -> usize {
        self.grid().map(|g| g.num_players()).unwrap_or(0)
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on inconsistent dimensions.
    pub fn validate(&self) -> Result<()> {
        self.grid()?;
        if self.embed_dim == 0 || self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "embed_dim {} must be a positive multiple of num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.depth == 0 {
            return Err(CoreError::InvalidConfig("depth must be positive".to_string()));
        }
        if self.mlp_ratio <= 0.0 {
            return Err(CoreError::InvalidConfig("mlp_ratio must be positive".to_string()));
        }
        Ok(())
    }

    /// Initialize the model.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if [`validate`](Self::validate) fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VisionTransformer<B>> {
        self.validate()?;
        Ok(VisionTransformer::new(self, device))
    }
}

/// Key mask handed to every attention layer.
#[derive(Clone)]
enum KeyMask<B: Backend> {
    /// Additive `[B, 1, 1, N + 1]` bias on attention logits.
    Bias(Tensor<B, 4>),
    /// Multiplicative `[B, 1, 1, N + 1]` weights on attention probabilities.
    Weights(Tensor<B, 4>),
}

/// Patch embedding: a strided convolution.
#[derive(Module, Debug)]
struct PatchEmbed<B: Backend> {
    proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    fn new(in_chans: usize, embed_dim: usize, patch_size: usize, device: &B::Device) -> Self {
        let proj = Conv2dConfig::new([in_chans, embed_dim], [patch_size, patch_size])
            .with_stride([patch_size, patch_size])
            .init(device);
        Self { proj }
    }

    /// `(B, C, H, W)` -> `(B, N, D)`.
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(x);
        let [batch, dim, rows, cols] = x.dims();
        x.reshape([batch, dim, rows * cols]).swap_dims(1, 2)
    }
}

impl<B: Backend> NamedParameters<B> for PatchEmbed<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.proj = self.proj.map_named(&join(prefix, "proj"), mapper);
        self
    }
}

/// Multi-head self-attention with an optional key mask.
#[derive(Module, Debug)]
struct Attention<B: Backend> {
    qkv: Linear<B>,
    proj: Linear<B>,
    dropout: Dropout,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    fn new(dim: usize, num_heads: usize, qkv_bias: bool, dropout: f64, device: &B::Device) -> Self {
        Self {
            qkv: LinearConfig::new(dim, dim * 3).with_bias(qkv_bias).init(device),
            proj: LinearConfig::new(dim, dim).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            num_heads,
        }
    }

    fn forward(&self, x: Tensor<B, 3>, key_mask: Option<&KeyMask<B>>) -> Tensor<B, 3> {
        let [batch, seq_len, dim] = x.dims();
        let head_dim = dim / self.num_heads;
        let scale = (head_dim as f64).powf(-0.5);

        let qkv = self.qkv.forward(x);
        let split = |i: usize| {
            qkv.clone()
                .slice([0..batch, 0..seq_len, i * dim..(i + 1) * dim])
                .reshape([batch, seq_len, self.num_heads, head_dim])
                .swap_dims(1, 2)
        };
        let (q, k, v) = (split(0), split(1), split(2));

        // (B, H, N, N)
        let mut scores = q.matmul(k.swap_dims(2, 3)) * scale;
        if let Some(KeyMask::Bias(bias)) = key_mask {
            scores = scores + bias.clone().repeat_dim(1, self.num_heads).repeat_dim(2, seq_len);
        }
        let mut attn = softmax(scores, 3);
        if let Some(KeyMask::Weights(weights)) = key_mask {
            attn = attn * weights.clone().repeat_dim(1, self.num_heads).repeat_dim(2, seq_len);
        }
        let attn = self.dropout.forward(attn);

        let out = attn.matmul(v).swap_dims(1, 2).reshape([batch, seq_len, dim]);
        self.dropout.forward(self.proj.forward(out))
    }
}

impl<B: Backend> NamedParameters<B> for Attention<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.qkv = self.qkv.map_named(&join(prefix, "qkv"), mapper);
        self.proj = self.proj.map_named(&join(prefix, "proj"), mapper);
        self
    }
}

#[derive(Module, Debug)]
struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    fn new(dim: usize, hidden: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(dim, hidden).init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(hidden, dim).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.act.forward(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        self.dropout.forward(self.fc2.forward(x))
    }
}

impl<B: Backend> NamedParameters<B> for Mlp<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.fc1 = self.fc1.map_named(&join(prefix, "fc1"), mapper);
        self.fc2 = self.fc2.map_named(&join(prefix, "fc2"), mapper);
        self
    }
}

/// Pre-norm transformer block.
#[derive(Module, Debug)]
struct Block<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
}

impl<B: Backend> Block<B> {
    fn new(config: &VisionTransformerConfig, device: &B::Device) -> Self {
        let dim = config.embed_dim;
        let hidden = (dim as f64 * config.mlp_ratio) as usize;
        Self {
            norm1: LayerNormConfig::new(dim)
                .with_epsilon(config.layer_norm_eps)
                .init(device),
            attn: Attention::new(dim, config.num_heads, config.qkv_bias, config.drop_rate, device),
            norm2: LayerNormConfig::new(dim)
                .with_epsilon(config.layer_norm_eps)
                .init(device),
            mlp: Mlp::new(dim, hidden, config.drop_rate, device),
        }
    }

    fn forward(&self, x: Tensor<B, 3>, key_mask: Option<&KeyMask<B>>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.norm1.forward(x), key_mask);
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

impl<B: Backend> NamedParameters<B> for Block<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.norm1 = self.norm1.map_named(&join(prefix, "norm1"), mapper);
        self.attn = self.attn.map_named(&join(prefix, "attn"), mapper);
        self.norm2 = self.norm2.map_named(&join(prefix, "norm2"), mapper);
        self.mlp = self.mlp.map_named(&join(prefix, "mlp"), mapper);
        self
    }
}

/// Features produced by [`VisionTransformer::forward_features`].
#[derive(Debug, Clone)]
pub struct ViTOutput<B: Backend> {
    /// Normalized class-token embedding `(B, D)`.
    pub cls: Tensor<B, 2>,
    /// Normalized per-player embeddings `(B, N, D)`.
    pub tokens: Tensor<B, 3>,
}

/// Vision Transformer backbone.
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: PatchEmbed<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    pos_drop: Dropout,
    blocks: Vec<Block<B>>,
    norm: LayerNorm<B>,
    head: Option<Linear<B>>,
    embed_dim: usize,
    img_size: usize,
    patch_size: usize,
}

impl<B: Backend> VisionTransformer<B> {
    /// Build the layers; [`VisionTransformerConfig::init`] validates `config` first.
    fn new(config: &VisionTransformerConfig, device: &B::Device) -> Self {
        let dim = config.embed_dim;
        let num_patches = config.num_patches();

        let cls_token = Tensor::random([1, 1, dim], Distribution::Normal(0.0, 0.02), device);
        let pos_embed = Tensor::random(
            [1, num_patches + 1, dim],
            Distribution::Normal(0.0, 0.02),
            device,
        );
        let blocks = (0..config.depth).map(|_| Block::new(config, device)).collect();
        let head = (config.num_classes > 0)
            .then(|| LinearConfig::new(dim, config.num_classes).init(device));

        Self {
            patch_embed: PatchEmbed::new(config.in_chans, dim, config.patch_size, device),
            cls_token: Param::from_tensor(cls_token),
            pos_embed: Param::from_tensor(pos_embed),
            pos_drop: DropoutConfig::new(config.drop_rate).init(),
            blocks,
            norm: LayerNormConfig::new(dim)
                .with_epsilon(config.layer_norm_eps)
                .init(device),
            head,
            embed_dim: dim,
            img_size: config.img_size,
            patch_size: config.patch_size,
        }
    }

    /// Token width.
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Player grid of this model.
    pub fn grid(&self) -> PatchGrid {
        let side = self.img_size / self.patch_size;
        PatchGrid::new(side, side, self.patch_size)
    }

    /// Number of players (patches).
    pub fn num_players(&self) -> usize {
        self.grid().num_players()
    }

    /// Whether the native classifier is present.
    pub fn has_head(&self) -> bool {
        self.head.is_some()
    }

    /// Drop the native classifier.
    pub fn without_head(mut self) -> Self {
        self.head = None;
        self
    }

    /// Run the encoder, injecting `mask` at `location`.
    ///
    /// With `mask = None` the forward pass is unmasked.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if the image size differs from
    /// the configured `img_size` or the mask does not have one value per player.
    pub fn forward_features(
        &self,
        images: Tensor<B, 4>,
        mask: Option<Tensor<B, 2>>,
        location: MaskLocation,
    ) -> Result<ViTOutput<B>> {
        let [batch, _, height, width] = images.dims();
        let grid = self.grid();
        if (height, width) != grid.image_hw() {
            return Err(CoreError::ShapeMismatch(format!(
                "expected {}x{} images, got {}x{}",
                self.img_size, self.img_size, height, width
            )));
        }
        if let Some(mask) = &mask {
            let [mask_batch, players] = mask.dims();
            if players != grid.num_players() || mask_batch != batch {
                return Err(CoreError::ShapeMismatch(format!(
                    "expected mask ({}, {}), got ({}, {})",
                    batch,
                    grid.num_players(),
                    mask_batch,
                    players
                )));
            }
        }

        let images = match (&mask, location) {
            (Some(m), MaskLocation::ZeroInput) => apply_zero_input(images, m.clone(), grid)?,
            _ => images,
        };

        let tokens = self.patch_embed.forward(images);
        let tokens = match (&mask, location) {
            (Some(m), MaskLocation::ZeroEmbedding) => zero_embeddings(tokens, m.clone()),
            _ => tokens,
        };

        let cls = self.cls_token.val().repeat_dim(0, batch);
        let x = Tensor::cat(vec![cls, tokens], 1) + self.pos_embed.val().repeat_dim(0, batch);
        let mut x = self.pos_drop.forward(x);

        let key_mask = mask.and_then(|m| match location {
            MaskLocation::PreSoftmax => Some(KeyMask::Bias(attention_bias(with_class_token(m)))),
            MaskLocation::RandomSampling => Some(KeyMask::Bias(attention_bias(with_class_token(
                sample_players(m),
            )))),
            MaskLocation::PostSoftmax => {
                let weights = with_class_token(m);
                let [b, n] = weights.dims();
                Some(KeyMask::Weights(weights.reshape([b, 1, 1, n])))
            }
            MaskLocation::ZeroInput | MaskLocation::ZeroEmbedding => None,
        });

        for block in &self.blocks {
            x = block.forward(x, key_mask.as_ref());
        }
        let x = self.norm.forward(x);

        let [_, seq_len, dim] = x.dims();
        let cls = x.clone().slice([0..batch, 0..1, 0..dim]).reshape([batch, dim]);
        let tokens = x.slice([0..batch, 1..seq_len, 0..dim]);
        Ok(ViTOutput { cls, tokens })
    }

    /// Unmasked classification with the native head.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the head was removed, or a
    /// shape error from [`forward_features`](Self::forward_features).
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let head = self.head.as_ref().ok_or_else(|| {
            CoreError::InvalidConfig("vision transformer has no classification head".to_string())
        })?;
        let features = self.forward_features(images, None, MaskLocation::ZeroInput)?;
        Ok(head.forward(features.cls))
    }
}

impl<B: Backend> NamedParameters<B> for VisionTransformer<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.patch_embed = self.patch_embed.map_named(&join(prefix, "patch_embed"), mapper);
        self.cls_token = mapper.map_param(&join(prefix, "cls_token"), self.cls_token);
        self.pos_embed = mapper.map_param(&join(prefix, "pos_embed"), self.pos_embed);
        self.blocks = self.blocks.map_named(&join(prefix, "blocks"), mapper);
        self.norm = self.norm.map_named(&join(prefix, "norm"), mapper);
        self.head = self.head.map_named(&join(prefix, "head"), mapper);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dict::state_dict;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> VisionTransformerConfig {
        VisionTransformerConfig {
            img_size: 32,
            patch_size: 8,
            embed_dim: 32,
            depth: 2,
            num_heads: 2,
            num_classes: 5,
            ..VisionTransformerConfig::vit_tiny_patch16_224()
        }
    }

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_presets() {
        assert_eq!(VisionTransformerConfig::vit_small_patch16_224().num_patches(), 196);
        assert_eq!(VisionTransformerConfig::vit_base_patch32_224().num_patches(), 49);
        assert!(VisionTransformerConfig::vit_large_patch16_224().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let config = VisionTransformerConfig {
            num_heads: 5,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_init_rejects_zero_heads() {
        let device = Default::default();
        let config = VisionTransformerConfig {
            num_heads: 0,
            ..tiny_config()
        };
        assert!(matches!(
            config.init::<TestBackend>(&device),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_forward_features_shapes() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        assert_eq!(model.num_players(), 16);

        let images = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 16], &device);
        for location in MaskLocation::ALL {
            let out = model
                .forward_features(images.clone(), Some(mask.clone()), location)
                .unwrap();
            assert_eq!(out.cls.dims(), [2, 32]);
            assert_eq!(out.tokens.dims(), [2, 16, 32]);
        }

        let logits = model.forward(images).unwrap();
        assert_eq!(logits.dims(), [2, 5]);
    }

    #[test]
    fn test_all_ones_mask_is_noop() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 16], &device);

        let reference = values(
            model
                .forward_features(images.clone(), None, MaskLocation::ZeroInput)
                .unwrap()
                .cls,
        );
        for location in [
            MaskLocation::ZeroInput,
            MaskLocation::ZeroEmbedding,
            MaskLocation::PostSoftmax,
            MaskLocation::RandomSampling,
        ] {
            let cls = values(
                model
                    .forward_features(images.clone(), Some(mask.clone()), location)
                    .unwrap()
                    .cls,
            );
            assert_eq!(cls, reference, "{}", location);
        }
    }

    #[test]
    fn test_masking_changes_output() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let mut rows = vec![1.0f32; 16];
        rows[..8].iter_mut().for_each(|v| *v = 0.0);
        let mask = Tensor::<TestBackend, 1>::from_floats(rows.as_slice(), &device).reshape([1, 16]);

        let reference = values(
            model
                .forward_features(images.clone(), None, MaskLocation::PreSoftmax)
                .unwrap()
                .cls,
        );
        let masked = values(
            model
                .forward_features(images, Some(mask), MaskLocation::PreSoftmax)
                .unwrap()
                .cls,
        );
        assert_ne!(masked, reference);
    }

    #[test]
    fn test_shape_errors() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 15], &device);
        assert!(matches!(
            model.forward_features(images, Some(mask), MaskLocation::PreSoftmax),
            Err(CoreError::ShapeMismatch(_))
        ));

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 40, 40], &device);
        assert!(matches!(
            model.forward_features(images, None, MaskLocation::PreSoftmax),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_parameter_names() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let state = state_dict(&model, "");
        for key in [
            "patch_embed.proj.weight",
            "patch_embed.proj.bias",
            "cls_token",
            "pos_embed",
            "blocks.0.norm1.weight",
            "blocks.0.attn.qkv.weight",
            "blocks.1.attn.proj.bias",
            "blocks.1.mlp.fc2.weight",
            "norm.bias",
            "head.weight",
        ] {
            assert!(state.contains(key), "missing {}", key);
        }

        let headless = state_dict(&model.without_head(), "");
        assert!(!headless.contains("head.weight"));
    }
}
