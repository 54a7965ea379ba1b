//! ResNet model architecture for images (torchvision layout).

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use vitshap_core::{CoreError, Result};

use crate::state_dict::{join, NamedParameters, ParamMapper};

/// Configuration for [`ResNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Blocks per stage.
    pub layers: [usize; 4],
    /// Bottleneck blocks (expansion 4) instead of basic blocks.
    pub bottleneck: bool,
    /// Width of the stem and first stage.
    pub base_width: usize,
    /// Number of input channels.
    pub in_chans: usize,
    /// Classes of the native `fc` head; 0 builds no head.
    pub num_classes: usize,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet50()
    }
}

impl ResNetConfig {
    fn preset(layers: [usize; 4], bottleneck: bool) -> Self {
        Self {
            layers,
            bottleneck,
            base_width: 64,
            in_chans: 3,
            num_classes: 1000,
        }
    }

    /// ResNet-18.
    pub fn resnet18() -> Self {
        Self::preset([2, 2, 2, 2], false)
    }

    /// ResNet-34.
    pub fn resnet34() -> Self {
        Self::preset([3, 4, 6, 3], false)
    }

    /// ResNet-50.
    pub fn resnet50() -> Self {
        Self::preset([3, 4, 6, 3], true)
    }

    /// ResNet-101.
    pub fn resnet101() -> Self {
        Self::preset([3, 4, 23, 3], true)
    }

    /// ResNet-152.
    pub fn resnet152() -> Self {
        Self::preset([3, 8, 36, 3], true)
    }

    /// Set the number of native classes.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Channel expansion of the last convolution in each block.
    pub fn expansion(&self) -> usize {
        if self.bottleneck {
            4
        } else {
            1
        }
    }

    /// Width of the pooled features fed to `fc`.
    pub fn feature_width(&self) -> usize {
        self.base_width * 8 * self.expansion()
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on empty stages or zero widths.
    pub fn validate(&self) -> Result<()> {
        if self.layers.iter().any(|&n| n == 0) {
            return Err(CoreError::InvalidConfig(format!(
                "every ResNet stage needs at least one block, got {:?}",
                self.layers
            )));
        }
        if self.base_width == 0 || self.in_chans == 0 {
            return Err(CoreError::InvalidConfig(
                "base_width and in_chans must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Initialize the model.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if [`validate`](Self::validate) fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        self.validate()?;
        Ok(ResNet::new(self, device))
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let pad = kernel / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_bias(false)
        .init(device)
}

/// Projection shortcut (`downsample.0` / `downsample.1`).
#[derive(Module, Debug)]
struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> NamedParameters<B> for Downsample<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.conv = self.conv.map_named(&join(prefix, "0"), mapper);
        self.bn = self.bn.map_named(&join(prefix, "1"), mapper);
        self
    }
}

/// Basic or bottleneck residual block.
///
/// Basic blocks leave `conv3`/`bn3` empty.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        in_channels: usize,
        planes: usize,
        stride: usize,
        bottleneck: bool,
        device: &B::Device,
    ) -> Self {
        let expansion = if bottleneck { 4 } else { 1 };
        let out_channels = planes * expansion;

        let (conv1, conv2, conv3) = if bottleneck {
            (
                conv(in_channels, planes, 1, 1, device),
                conv(planes, planes, 3, stride, device),
                Some(conv(planes, out_channels, 1, 1, device)),
            )
        } else {
            (
                conv(in_channels, planes, 3, stride, device),
                conv(planes, planes, 3, 1, device),
                None,
            )
        };
        let bn3 = bottleneck.then(|| BatchNormConfig::new(out_channels).init(device));

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv(in_channels, out_channels, 1, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1,
            bn1: BatchNormConfig::new(planes).init(device),
            conv2,
            bn2: BatchNormConfig::new(planes).init(device),
            conv3,
            bn3,
            downsample,
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let relu = Relu::new();

        let out = relu.forward(self.bn1.forward(self.conv1.forward(x.clone())));
        let mut out = self.bn2.forward(self.conv2.forward(out));
        if let (Some(conv3), Some(bn3)) = (&self.conv3, &self.bn3) {
            out = bn3.forward(conv3.forward(relu.forward(out)));
        }

        let shortcut = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(x)),
            None => x,
        };

        relu.forward(out + shortcut)
    }
}

impl<B: Backend> NamedParameters<B> for ResidualBlock<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.conv1 = self.conv1.map_named(&join(prefix, "conv1"), mapper);
        self.bn1 = self.bn1.map_named(&join(prefix, "bn1"), mapper);
        self.conv2 = self.conv2.map_named(&join(prefix, "conv2"), mapper);
        self.bn2 = self.bn2.map_named(&join(prefix, "bn2"), mapper);
        self.conv3 = self.conv3.map_named(&join(prefix, "conv3"), mapper);
        self.bn3 = self.bn3.map_named(&join(prefix, "bn3"), mapper);
        self.downsample = self.downsample.map_named(&join(prefix, "downsample"), mapper);
        self
    }
}

/// ResNet backbone.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: Vec<ResidualBlock<B>>,
    layer2: Vec<ResidualBlock<B>>,
    layer3: Vec<ResidualBlock<B>>,
    layer4: Vec<ResidualBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Option<Linear<B>>,
    feature_width: usize,
}

impl<B: Backend> ResNet<B> {
    /// Build the layers; [`ResNetConfig::init`] validates `config` first.
    fn new(config: &ResNetConfig, device: &B::Device) -> Self {
        let width = config.base_width;
        let expansion = config.expansion();

        let conv1 = Conv2dConfig::new([config.in_chans, width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut in_channels = width;
        let mut stages = Vec::with_capacity(4);
        for (stage, &n_blocks) in config.layers.iter().enumerate() {
            let planes = width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let blocks: Vec<_> = (0..n_blocks)
                .map(|i| {
                    let block_stride = if i == 0 { stride } else { 1 };
                    let block =
                        ResidualBlock::new(in_channels, planes, block_stride, config.bottleneck, device);
                    in_channels = planes * expansion;
                    block
                })
                .collect();
            stages.push(blocks);
        }
        let mut stages = stages.into_iter();
        let mut next = || stages.next().unwrap_or_default();

        let feature_width = config.feature_width();
        let fc = (config.num_classes > 0)
            .then(|| LinearConfig::new(feature_width, config.num_classes).init(device));

        Self {
            conv1,
            bn1: BatchNormConfig::new(width).init(device),
            maxpool,
            layer1: next(),
            layer2: next(),
            layer3: next(),
            layer4: next(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc,
            feature_width,
        }
    }

    /// Width of the pooled features.
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    /// Whether the native `fc` head is present.
    pub fn has_head(&self) -> bool {
        self.fc.is_some()
    }

    /// Drop the native `fc` head.
    pub fn without_head(mut self) -> Self {
        self.fc = None;
        self
    }

    /// Pooled features `(B, feature_width)`.
    pub fn forward_features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = Relu::new().forward(self.bn1.forward(self.conv1.forward(x)));
        let mut x = self.maxpool.forward(x);
        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        let x = self.avgpool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    /// Classification with the native head.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the head was removed.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let fc = self
            .fc
            .as_ref()
            .ok_or_else(|| CoreError::InvalidConfig("ResNet has no fc head".to_string()))?;
        Ok(fc.forward(self.forward_features(x)))
    }
}

impl<B: Backend> NamedParameters<B> for ResNet<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.conv1 = self.conv1.map_named(&join(prefix, "conv1"), mapper);
        self.bn1 = self.bn1.map_named(&join(prefix, "bn1"), mapper);
        self.layer1 = self.layer1.map_named(&join(prefix, "layer1"), mapper);
        self.layer2 = self.layer2.map_named(&join(prefix, "layer2"), mapper);
        self.layer3 = self.layer3.map_named(&join(prefix, "layer3"), mapper);
        self.layer4 = self.layer4.map_named(&join(prefix, "layer4"), mapper);
        self.fc = self.fc.map_named(&join(prefix, "fc"), mapper);
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

    fn small(bottleneck: bool) -> ResNetConfig {
        ResNetConfig {
            layers: [1, 1, 1, 1],
            bottleneck,
            base_width: 4,
            in_chans: 3,
            num_classes: 3,
        }
    }

    #[test]
    fn test_feature_widths() {
        assert_eq!(ResNetConfig::resnet18().feature_width(), 512);
        assert_eq!(ResNetConfig::resnet50().feature_width(), 2048);
        assert_eq!(ResNetConfig::resnet152().layers, [3, 8, 36, 3]);
    }

    #[test]
    fn test_validate() {
        let config = ResNetConfig {
            layers: [1, 0, 1, 1],
            ..small(false)
        };
        assert!(config.validate().is_err());
        assert!(small(true).validate().is_ok());
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        for bottleneck in [false, true] {
            let config = small(bottleneck);
            let model = config.init::<TestBackend>(&device).unwrap();
            let x = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Normal(0.0, 1.0), &device);
            assert_eq!(model.forward_features(x.clone()).dims(), [2, config.feature_width()]);
            assert_eq!(model.forward(x).unwrap().dims(), [2, 3]);
        }
    }

    #[test]
    fn test_headless_forward_fails() {
        let device = Default::default();
        let model = small(false).init::<TestBackend>(&device).unwrap().without_head();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert!(model.forward(x).is_err());
    }

    #[test]
    fn test_torchvision_names() {
        let device = Default::default();
        let model = small(true).init::<TestBackend>(&device).unwrap();
        let state = state_dict(&model, "");
        for key in [
            "conv1.weight",
            "bn1.running_var",
            "layer1.0.conv3.weight",
            "layer1.0.downsample.0.weight",
            "layer2.0.downsample.1.running_mean",
            "layer4.0.bn3.bias",
            "fc.weight",
            "fc.bias",
        ] {
            assert!(state.contains(key), "missing {}", key);
        }
        assert!(!state.contains("conv1.bias"));
    }
}
