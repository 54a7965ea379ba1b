//! DenseNet model architecture for images (torchvision layout).
//!
//! Based on "Densely Connected Convolutional Networks" by Huang et al. (2017).
//! Every parameter lives under `features.*` except the `classifier`.

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{
        AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d,
        MaxPool2dConfig,
    },
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    Relu,
};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use vitshap_core::{CoreError, Result};

use crate::state_dict::{join, NamedParameters, ParamMapper};

/// Configuration for [`DenseNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseNetConfig {
    /// Channels added by each dense layer.
    pub growth_rate: usize,
    /// Dense layers per block.
    pub block_config: [usize; 4],
    /// Channels produced by the stem.
    pub num_init_features: usize,
    /// Bottleneck width multiplier.
    pub bn_size: usize,
    /// Number of input channels.
    pub in_chans: usize,
    /// Classes of the native `classifier`; 0 builds no head.
    pub num_classes: usize,
    /// Dropout after each dense layer.
    pub drop_rate: f64,
}

impl Default for DenseNetConfig {
    fn default() -> Self {
        Self::densenet121()
    }
}

impl DenseNetConfig {
    fn preset(growth_rate: usize, block_config: [usize; 4], num_init_features: usize) -> Self {
        Self {
            growth_rate,
            block_config,
            num_init_features,
            bn_size: 4,
            in_chans: 3,
            num_classes: 1000,
            drop_rate: 0.0,
        }
    }

    /// DenseNet-121.
    pub fn densenet121() -> Self {
        Self::preset(32, [6, 12, 24, 16], 64)
    }

    /// DenseNet-161.
    pub fn densenet161() -> Self {
        Self::preset(48, [6, 12, 36, 24], 96)
    }

    /// DenseNet-169.
    pub fn densenet169() -> Self {
        Self::preset(32, [6, 12, 32, 32], 64)
    }

    /// DenseNet-201.
    pub fn densenet201() -> Self {
        Self::preset(32, [6, 12, 48, 32], 64)
    }

    /// Set the number of native classes.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Width of the pooled features fed to `classifier`.
    pub fn feature_width(&self) -> usize {
        let mut features = self.num_init_features;
        for (i, &n_layers) in self.block_config.iter().enumerate() {
            features += n_layers * self.growth_rate;
            if i + 1 < self.block_config.len() {
                features /= 2;
            }
        }
        features
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on zero widths or empty blocks.
    pub fn validate(&self) -> Result<()> {
        if self.growth_rate == 0 || self.num_init_features == 0 || self.bn_size == 0 {
            return Err(CoreError::InvalidConfig(
                "growth_rate, num_init_features and bn_size must be positive".to_string(),
            ));
        }
        if self.block_config.iter().any(|&n| n == 0) {
            return Err(CoreError::InvalidConfig(format!(
                "every dense block needs at least one layer, got {:?}",
                self.block_config
            )));
        }
        Ok(())
    }

    /// Initialize the model.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if [`validate`](Self::validate) fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DenseNet<B>> {
        self.validate()?;
        Ok(DenseNet::new(self, device))
    }
}

/// BN-ReLU-Conv1x1-BN-ReLU-Conv3x3, output concatenated to the input.
#[derive(Module, Debug)]
struct DenseLayer<B: Backend> {
    norm1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    dropout: Dropout,
}

impl<B: Backend> DenseLayer<B> {
    fn new(in_features: usize, config: &DenseNetConfig, device: &B::Device) -> Self {
        let inner = config.bn_size * config.growth_rate;
        Self {
            norm1: BatchNormConfig::new(in_features).init(device),
            conv1: Conv2dConfig::new([in_features, inner], [1, 1])
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(inner).init(device),
            conv2: Conv2dConfig::new([inner, config.growth_rate], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            dropout: DropoutConfig::new(config.drop_rate).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let relu = Relu::new();
        let out = self.conv1.forward(relu.forward(self.norm1.forward(x.clone())));
        let out = self.conv2.forward(relu.forward(self.norm2.forward(out)));
        Tensor::cat(vec![x, self.dropout.forward(out)], 1)
    }
}

impl<B: Backend> NamedParameters<B> for DenseLayer<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.norm1 = self.norm1.map_named(&join(prefix, "norm1"), mapper);
        self.conv1 = self.conv1.map_named(&join(prefix, "conv1"), mapper);
        self.norm2 = self.norm2.map_named(&join(prefix, "norm2"), mapper);
        self.conv2 = self.conv2.map_named(&join(prefix, "conv2"), mapper);
        self
    }
}

/// A dense block; layers are named `denselayer1..`.
#[derive(Module, Debug)]
struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}

impl<B: Backend> NamedParameters<B> for DenseBlock<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| layer.map_named(&join(prefix, &format!("denselayer{}", i + 1)), mapper))
            .collect();
        self
    }
}

/// BN-ReLU-Conv1x1 halving the channels, then 2x2 average pooling.
#[derive(Module, Debug)]
struct Transition<B: Backend> {
    norm: BatchNorm<B, 2>,
    conv: Conv2d<B>,
    pool: AvgPool2d,
}

impl<B: Backend> Transition<B> {
    fn new(in_features: usize, out_features: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(in_features).init(device),
            conv: Conv2dConfig::new([in_features, out_features], [1, 1])
                .with_bias(false)
                .init(device),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = Relu::new().forward(self.norm.forward(x));
        self.pool.forward(self.conv.forward(x))
    }
}

impl<B: Backend> NamedParameters<B> for Transition<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.norm = self.norm.map_named(&join(prefix, "norm"), mapper);
        self.conv = self.conv.map_named(&join(prefix, "conv"), mapper);
        self
    }
}

/// DenseNet backbone.
#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    conv0: Conv2d<B>,
    norm0: BatchNorm<B, 2>,
    pool0: MaxPool2d,
    blocks: Vec<DenseBlock<B>>,
    transitions: Vec<Transition<B>>,
    norm5: BatchNorm<B, 2>,
    avgpool: AdaptiveAvgPool2d,
    classifier: Option<Linear<B>>,
    feature_width: usize,
}

impl<B: Backend> DenseNet<B> {
    /// Build the layers; [`DenseNetConfig::init`] validates `config` first.
    fn new(config: &DenseNetConfig, device: &B::Device) -> Self {
        let conv0 = Conv2dConfig::new([config.in_chans, config.num_init_features], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let pool0 = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut num_features = config.num_init_features;
        let mut blocks = Vec::with_capacity(config.block_config.len());
        let mut transitions = Vec::with_capacity(config.block_config.len() - 1);
        for (i, &n_layers) in config.block_config.iter().enumerate() {
            let layers = (0..n_layers)
                .map(|j| DenseLayer::new(num_features + j * config.growth_rate, config, device))
                .collect();
            blocks.push(DenseBlock { layers });
            num_features += n_layers * config.growth_rate;

            if i + 1 < config.block_config.len() {
                transitions.push(Transition::new(num_features, num_features / 2, device));
                num_features /= 2;
            }
        }

        let classifier = (config.num_classes > 0)
            .then(|| LinearConfig::new(num_features, config.num_classes).init(device));

        Self {
            conv0,
            norm0: BatchNormConfig::new(config.num_init_features).init(device),
            pool0,
            blocks,
            transitions,
            norm5: BatchNormConfig::new(num_features).init(device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier,
            feature_width: num_features,
        }
    }

    /// Width of the pooled features.
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    /// Whether the native classifier is present.
    pub fn has_head(&self) -> bool {
        self.classifier.is_some()
    }

    /// Drop the native classifier.
    pub fn without_head(mut self) -> Self {
        self.classifier = None;
        self
    }

    /// Pooled features `(B, feature_width)`.
    pub fn forward_features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let relu = Relu::new();
        let x = relu.forward(self.norm0.forward(self.conv0.forward(x)));
        let mut x = self.pool0.forward(x);
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if let Some(transition) = self.transitions.get(i) {
                x = transition.forward(x);
            }
        }
        let x = relu.forward(self.norm5.forward(x));
        let x = self.avgpool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    /// Classification with the native head.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the classifier was removed.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let classifier = self
            .classifier
            .as_ref()
            .ok_or_else(|| CoreError::InvalidConfig("DenseNet has no classifier".to_string()))?;
        Ok(classifier.forward(self.forward_features(x)))
    }
}

impl<B: Backend> NamedParameters<B> for DenseNet<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        let features = join(prefix, "features");
        self.conv0 = self.conv0.map_named(&join(&features, "conv0"), mapper);
        self.norm0 = self.norm0.map_named(&join(&features, "norm0"), mapper);

        let mut blocks = Vec::with_capacity(self.blocks.len());
        let mut transitions = Vec::with_capacity(self.transitions.len());
        let mut pending = self.transitions.into_iter();
        for (i, block) in self.blocks.into_iter().enumerate() {
            let name = format!("denseblock{}", i + 1);
            blocks.push(block.map_named(&join(&features, &name), mapper));
            if let Some(transition) = pending.next() {
                let name = format!("transition{}", i + 1);
                transitions.push(transition.map_named(&join(&features, &name), mapper));
            }
        }
        self.blocks = blocks;
        self.transitions = transitions;

        self.norm5 = self.norm5.map_named(&join(&features, "norm5"), mapper);
        self.classifier = self.classifier.map_named(&join(prefix, "classifier"), mapper);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dict::state_dict;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small() -> DenseNetConfig {
        DenseNetConfig {
            growth_rate: 4,
            block_config: [1, 1, 1, 1],
            num_init_features: 8,
            bn_size: 2,
            in_chans: 3,
            num_classes: 3,
            drop_rate: 0.0,
        }
    }

    #[test]
    fn test_feature_widths() {
        assert_eq!(DenseNetConfig::densenet121().feature_width(), 1024);
        assert_eq!(DenseNetConfig::densenet161().feature_width(), 2208);
        assert_eq!(DenseNetConfig::densenet169().feature_width(), 1664);
        assert_eq!(DenseNetConfig::densenet201().feature_width(), 1920);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let config = small();
        let model = config.init::<TestBackend>(&device).unwrap();
        assert_eq!(model.feature_width(), config.feature_width());

        let x = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.forward_features(x.clone()).dims(), [2, config.feature_width()]);
        assert_eq!(model.forward(x).unwrap().dims(), [2, 3]);
    }

    #[test]
    fn test_torchvision_names() {
        let device = Default::default();
        let model = small().init::<TestBackend>(&device).unwrap();
        let state = state_dict(&model, "");
        for key in [
            "features.conv0.weight",
            "features.norm0.running_mean",
            "features.denseblock1.denselayer1.norm1.weight",
            "features.denseblock4.denselayer1.conv2.weight",
            "features.transition1.conv.weight",
            "features.transition3.norm.bias",
            "features.norm5.weight",
            "classifier.weight",
        ] {
            assert!(state.contains(key), "missing {}", key);
        }
        assert!(!state.contains("features.transition4.conv.weight"));
    }
}
