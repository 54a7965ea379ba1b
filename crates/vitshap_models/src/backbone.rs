//! Uniform masked forward over the supported backbone families.

use burn::prelude::*;
use vitshap_core::{BackboneKind, CoreError, MaskLocation, PatchGrid, Result, DEFAULT_NUM_PLAYERS};

use crate::densenet::DenseNet;
use crate::masking::convnet_zero_input;
use crate::resnet::ResNet;
use crate::state_dict::{NamedParameters, ParamMapper};
use crate::vit::VisionTransformer;

/// Output of [`Backbone::forward_masked`].
#[derive(Debug, Clone)]
pub struct BackboneOutput<B: Backend> {
    /// Class-token (transformer) or pooled (convnet) embedding `(B, feature_width)`.
    pub embedding: Tensor<B, 2>,
    /// Per-player embeddings `(B, num_players, feature_width)`; transformers only.
    pub tokens: Option<Tensor<B, 3>>,
}

/// A backbone of one of the supported families.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    /// Vision Transformer.
    VisionTransformer(VisionTransformer<B>),
    /// ResNet family.
    ResNet(ResNet<B>),
    /// DenseNet family.
    DenseNet(DenseNet<B>),
}

impl<B: Backend> From<VisionTransformer<B>> for Backbone<B> {
    fn from(model: VisionTransformer<B>) -> Self {
        Backbone::VisionTransformer(model)
    }
}

impl<B: Backend> From<ResNet<B>> for Backbone<B> {
    fn from(model: ResNet<B>) -> Self {
        Backbone::ResNet(model)
    }
}

impl<B: Backend> From<DenseNet<B>> for Backbone<B> {
    fn from(model: DenseNet<B>) -> Self {
        Backbone::DenseNet(model)
    }
}

impl<B: Backend> Backbone<B> {
    /// Architecture family.
    pub fn kind(&self) -> BackboneKind {
        match self {
            Backbone::VisionTransformer(_) => BackboneKind::Transformer,
            Backbone::ResNet(_) => BackboneKind::ResNet,
            Backbone::DenseNet(_) => BackboneKind::DenseNet,
        }
    }

    /// Width of the embedding fed to the head.
    pub fn feature_width(&self) -> usize {
        match self {
            Backbone::VisionTransformer(m) => m.embed_dim(),
            Backbone::ResNet(m) => m.feature_width(),
            Backbone::DenseNet(m) => m.feature_width(),
        }
    }

    /// Player grid: the patch grid for transformers, 14x14 of 16 px otherwise.
    pub fn patch_grid(&self) -> PatchGrid {
        match self {
            Backbone::VisionTransformer(m) => m.grid(),
            Backbone::ResNet(_) | Backbone::DenseNet(_) => PatchGrid::convnet_default(),
        }
    }

    /// Number of players.
    pub fn num_players(&self) -> usize {
        match self {
            Backbone::VisionTransformer(m) => m.num_players(),
            Backbone::ResNet(_) | Backbone::DenseNet(_) => DEFAULT_NUM_PLAYERS,
        }
    }

    /// Whether the family's own classifier (`head`, `fc`, `classifier`) is present.
    pub fn has_native_head(&self) -> bool {
        match self {
            Backbone::VisionTransformer(m) => m.has_head(),
            Backbone::ResNet(m) => m.has_head(),
            Backbone::DenseNet(m) => m.has_head(),
        }
    }

    /// Replace the native classifier with the identity.
    pub fn without_head(self) -> Self {
        match self {
            Backbone::VisionTransformer(m) => Backbone::VisionTransformer(m.without_head()),
            Backbone::ResNet(m) => Backbone::ResNet(m.without_head()),
            Backbone::DenseNet(m) => Backbone::DenseNet(m.without_head()),
        }
    }

    /// Masked forward at `location`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidMaskLocation`] if the family does not support `location`
    /// - [`CoreError::ShapeMismatch`] on mask width, batch, or image size mismatches
    pub fn forward_masked(
        &self,
        images: Tensor<B, 4>,
        mask: Tensor<B, 2>,
        location: MaskLocation,
    ) -> Result<BackboneOutput<B>> {
        self.kind().check(location)?;
        let [batch, players] = mask.dims();
        if players != self.num_players() {
            return Err(CoreError::ShapeMismatch(format!(
                "mask has {} players, backbone has {}",
                players,
                self.num_players()
            )));
        }
        if batch != images.dims()[0] {
            return Err(CoreError::ShapeMismatch(format!(
                "mask batch {} != image batch {}",
                batch,
                images.dims()[0]
            )));
        }

        match self {
            Backbone::VisionTransformer(m) => {
                let out = m.forward_features(images, Some(mask), location)?;
                Ok(BackboneOutput {
                    embedding: out.cls,
                    tokens: Some(out.tokens),
                })
            }
            Backbone::ResNet(m) => Ok(BackboneOutput {
                embedding: m.forward_features(convnet_zero_input(images, mask)?),
                tokens: None,
            }),
            Backbone::DenseNet(m) => Ok(BackboneOutput {
                embedding: m.forward_features(convnet_zero_input(images, mask)?),
                tokens: None,
            }),
        }
    }

    /// Forward without any mask.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if a transformer receives images of
    /// the wrong size.
    pub fn forward_unmasked(&self, images: Tensor<B, 4>) -> Result<BackboneOutput<B>> {
        match self {
            Backbone::VisionTransformer(m) => {
                let out = m.forward_features(images, None, MaskLocation::ZeroInput)?;
                Ok(BackboneOutput {
                    embedding: out.cls,
                    tokens: Some(out.tokens),
                })
            }
            Backbone::ResNet(m) => Ok(BackboneOutput {
                embedding: m.forward_features(images),
                tokens: None,
            }),
            Backbone::DenseNet(m) => Ok(BackboneOutput {
                embedding: m.forward_features(images),
                tokens: None,
            }),
        }
    }

    /// Classify with the native head.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the native head was stripped.
    pub fn classify(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        match self {
            Backbone::VisionTransformer(m) => m.forward(images),
            Backbone::ResNet(m) => m.forward(images),
            Backbone::DenseNet(m) => m.forward(images),
        }
    }
}

impl<B: Backend> NamedParameters<B> for Backbone<B> {
    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        match self {
            Backbone::VisionTransformer(m) => Backbone::VisionTransformer(m.map_named(prefix, mapper)),
            Backbone::ResNet(m) => Backbone::ResNet(m.map_named(prefix, mapper)),
            Backbone::DenseNet(m) => Backbone::DenseNet(m.map_named(prefix, mapper)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resnet::ResNetConfig;
    use crate::vit::VisionTransformerConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_vit() -> Backbone<TestBackend> {
        let config = VisionTransformerConfig {
            img_size: 32,
            patch_size: 8,
            embed_dim: 16,
            depth: 1,
            num_heads: 2,
            ..Default::default()
        };
        config.init(&Default::default()).unwrap().into()
    }

    fn small_resnet() -> Backbone<TestBackend> {
        let config = ResNetConfig {
            layers: [1, 1, 1, 1],
            base_width: 4,
            ..ResNetConfig::resnet18()
        };
        config.init(&Default::default()).unwrap().into()
    }

    #[test]
    fn test_kinds_and_players() {
        let vit = small_vit();
        assert_eq!(vit.kind(), BackboneKind::Transformer);
        assert_eq!(vit.num_players(), 16);
        assert_eq!(vit.feature_width(), 16);

        let resnet = small_resnet();
        assert_eq!(resnet.kind(), BackboneKind::ResNet);
        assert_eq!(resnet.num_players(), 196);
        assert_eq!(resnet.feature_width(), 32);
    }

    #[test]
    fn test_without_head() {
        let resnet = small_resnet();
        assert!(resnet.has_native_head());
        let resnet = resnet.without_head();
        assert!(!resnet.has_native_head());
        assert!(resnet.classify(Tensor::zeros([1, 3, 32, 32], &Default::default())).is_err());
    }

    #[test]
    fn test_convnet_rejects_attention_locations() {
        let device = Default::default();
        let resnet = small_resnet();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 224, 224], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 196], &device);
        assert!(matches!(
            resnet.forward_masked(images, mask, MaskLocation::PreSoftmax),
            Err(CoreError::InvalidMaskLocation { .. })
        ));
    }

    #[test]
    fn test_convnet_zero_input_forward() {
        let device = Default::default();
        let resnet = small_resnet();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 224, 224], &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 196], &device);
        let out = resnet
            .forward_masked(images, mask, MaskLocation::ZeroInput)
            .unwrap();
        assert_eq!(out.embedding.dims(), [2, 32]);
        assert!(out.tokens.is_none());
    }

    #[test]
    fn test_mask_width_mismatch() {
        let device = Default::default();
        let vit = small_vit();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 17], &device);
        assert!(matches!(
            vit.forward_masked(images, mask, MaskLocation::ZeroEmbedding),
            Err(CoreError::ShapeMismatch(_))
        ));
    }
}
