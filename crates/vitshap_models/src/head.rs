//! Linear prediction head.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::state_dict::{NamedParameters, ParamMapper};

/// Configuration for [`Head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Backbone feature width.
    pub in_features: usize,
    /// Output dimension.
    pub out_features: usize,
}

impl HeadConfig {
    /// Create a new config.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
        }
    }

    /// Initialize the head.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Head<B> {
        Head {
            linear: LinearConfig::new(self.in_features, self.out_features).init(device),
        }
    }
}

/// Single linear layer producing raw logits.
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> Head<B> {
    /// `(B, in_features)` -> `(B, out_features)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(x)
    }

    /// Output dimension.
    pub fn out_features(&self) -> usize {
        self.linear.weight.val().dims()[1]
    }
}

// The head is a bare linear layer in checkpoints: `head.weight`, `head.bias`.
impl<B: Backend> NamedParameters<B> for Head<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.linear = self.linear.map_named(prefix, mapper);
        self
    }
}
