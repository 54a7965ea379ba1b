//! Named parameter maps and the non-strict merge.
//!
//! Every module in this crate exposes its parameters under dotted names that
//! follow the timm/torchvision layout (`blocks.0.attn.qkv.weight`,
//! `layer1.0.bn1.running_mean`, `features.denseblock1.denselayer1.conv1.weight`).
//! Tensors keep burn's own layout (a [`Linear`] weight is `[d_input, d_output]`).
//!
//! Traversal goes through [`NamedParameters::map_named`] with a
//! [`ParamMapper`]: the exporter copies values into a [`StateDict`], the
//! loader replaces values that are present with a matching shape and records
//! everything else in a [`LoadReport`].

use std::collections::{BTreeMap, BTreeSet};

use burn::module::{Param, RunningState};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, LayerNorm, Linear};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// A flattened tensor with its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Tensor dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl TensorRecord {
    /// Copy a tensor's values.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Self {
        let shape = tensor.dims().to_vec();
        let data = tensor.into_data().iter::<f32>().collect();
        Self { shape, data }
    }

    /// Whether `data` holds exactly as many values as `shape` describes.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.shape.iter().product::<usize>()
    }

    /// Materialize the record on `device`. The record must be consistent.
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        let data = TensorData::new(self.data.clone(), self.shape.clone());
        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }

    /// Number of scalar values.
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Ordered map from parameter name to tensor values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict(BTreeMap<String, TensorRecord>);

impl StateDict {
    /// Create an empty state dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, returning the previous value if any.
    pub fn insert(&mut self, name: impl Into<String>, record: TensorRecord) -> Option<TensorRecord> {
        self.0.insert(name.into(), record)
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.0.get(name)
    }

    /// Remove a parameter.
    pub fn remove(&mut self, name: &str) -> Option<TensorRecord> {
        self.0.remove(name)
    }

    /// Whether a parameter exists.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Rename a parameter. Returns `false` if `from` does not exist.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.0.remove(from) {
            Some(record) => {
                self.0.insert(to.into(), record);
                true
            }
            None => false,
        }
    }

    /// Parameter names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Iterate over `(name, record)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorRecord)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the state dict is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of scalar values.
    pub fn numel(&self) -> usize {
        self.0.values().map(TensorRecord::numel).sum()
    }

    /// Names of records whose data does not fill their shape.
    pub fn inconsistent_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, record)| !record.is_consistent())
            .map(|(name, _)| name)
            .collect()
    }

    /// Entries under `prefix.`, with the prefix removed.
    pub fn strip_prefix(&self, prefix: &str) -> StateDict {
        let lead = format!("{}.", prefix);
        StateDict(
            self.0
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&lead).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        )
    }
}

impl FromIterator<(String, TensorRecord)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, TensorRecord)>>(iter: I) -> Self {
        StateDict(iter.into_iter().collect())
    }
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Parameters copied from the state dict.
    pub loaded: Vec<String>,
    /// Expected by the model, absent from the state dict.
    pub missing_keys: Vec<String>,
    /// Present in the state dict, unknown to the model.
    pub unexpected_keys: Vec<String>,
    /// Present on both sides but unusable (different shape, or data that does
    /// not fill the shape); left untouched.
    pub mismatched_keys: Vec<String>,
}

impl LoadReport {
    /// Whether every expected parameter was loaded and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty() && self.mismatched_keys.is_empty()
    }

    /// Emit the report through `tracing`.
    pub fn log(&self, source: &str) {
        tracing::info!(
            "Model parameters were updated from {} ({} loaded)",
            source,
            self.loaded.len()
        );
        tracing::info!("Unmatched parameters - missing_keys:    {:?}", self.missing_keys);
        tracing::info!("Unmatched parameters - unexpected_keys: {:?}", self.unexpected_keys);
        if !self.mismatched_keys.is_empty() {
            tracing::warn!("Mismatched parameters were skipped: {:?}", self.mismatched_keys);
        }
    }
}

/// Visits named parameters and may replace their values.
pub trait ParamMapper<B: Backend> {
    /// Map a trainable parameter.
    fn map_param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>>;

    /// Map a non-trainable buffer (batch-norm running statistics).
    fn map_buffer<const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Tensor<B, D>;
}

/// Modules whose parameters can be addressed by dotted name.
pub trait NamedParameters<B: Backend>: Sized {
    /// Pass every parameter through `mapper`, naming it under `prefix`.
    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self;
}

/// Join a prefix and a child name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Export all parameters of `module`.
pub fn state_dict<B: Backend, M: NamedParameters<B> + Clone>(module: &M, prefix: &str) -> StateDict {
    let mut exporter = Exporter {
        state: StateDict::new(),
    };
    let _ = module.clone().map_named(prefix, &mut exporter);
    exporter.state
}

/// Merge `state` into `module` by name without failing on mismatches.
pub fn load_state_dict<B: Backend, M: NamedParameters<B>>(
    module: M,
    prefix: &str,
    state: &StateDict,
) -> (M, LoadReport) {
    let mut loader = Loader {
        state,
        expected: BTreeSet::new(),
        report: LoadReport::default(),
    };
    let module = module.map_named(prefix, &mut loader);
    let Loader {
        expected, mut report, ..
    } = loader;
    report.unexpected_keys = state
        .keys()
        .filter(|k| !expected.contains(*k))
        .map(str::to_string)
        .collect();
    (module, report)
}

struct Exporter {
    state: StateDict,
}

impl<B: Backend> ParamMapper<B> for Exporter {
    fn map_param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        self.state.insert(name, TensorRecord::from_tensor(param.val()));
        param
    }

    fn map_buffer<const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Tensor<B, D> {
        self.state.insert(name, TensorRecord::from_tensor(tensor.clone()));
        tensor
    }
}

struct Loader<'a> {
    state: &'a StateDict,
    expected: BTreeSet<String>,
    report: LoadReport,
}

impl Loader<'_> {
    /// Record `name` and return the matching record when it fits `dims`.
    fn lookup(&mut self, name: &str, dims: &[usize]) -> Option<&TensorRecord> {
        self.expected.insert(name.to_string());
        match self.state.get(name) {
            None => {
                self.report.missing_keys.push(name.to_string());
                None
            }
            Some(record) if record.shape.as_slice() != dims || !record.is_consistent() => {
                self.report.mismatched_keys.push(name.to_string());
                None
            }
            Some(record) => {
                self.report.loaded.push(name.to_string());
                Some(record)
            }
        }
    }
}

impl<B: Backend> ParamMapper<B> for Loader<'_> {
    fn map_param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let dims = param.val().dims();
        match self.lookup(name, &dims) {
            Some(record) => param.map(|tensor| {
                let require_grad = tensor.is_require_grad();
                record
                    .to_tensor::<B, D>(&tensor.device())
                    .set_require_grad(require_grad)
            }),
            None => param,
        }
    }

    fn map_buffer<const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let dims = tensor.dims();
        match self.lookup(name, &dims) {
            Some(record) => record.to_tensor::<B, D>(&tensor.device()),
            None => tensor,
        }
    }
}

// ============================================================================
// burn building blocks
// ============================================================================

impl<B: Backend> NamedParameters<B> for Linear<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.weight = mapper.map_param(&join(prefix, "weight"), self.weight);
        self.bias = self.bias.map(|b| mapper.map_param(&join(prefix, "bias"), b));
        self
    }
}

impl<B: Backend> NamedParameters<B> for Conv2d<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.weight = mapper.map_param(&join(prefix, "weight"), self.weight);
        self.bias = self.bias.map(|b| mapper.map_param(&join(prefix, "bias"), b));
        self
    }
}

impl<B: Backend> NamedParameters<B> for LayerNorm<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.gamma = mapper.map_param(&join(prefix, "weight"), self.gamma);
        self.beta = mapper.map_param(&join(prefix, "bias"), self.beta);
        self
    }
}

impl<B: Backend> NamedParameters<B> for BatchNorm<B, 2> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.gamma = mapper.map_param(&join(prefix, "weight"), self.gamma);
        self.beta = mapper.map_param(&join(prefix, "bias"), self.beta);
        let mean = mapper.map_buffer(&join(prefix, "running_mean"), self.running_mean.value());
        let var = mapper.map_buffer(&join(prefix, "running_var"), self.running_var.value());
        self.running_mean = RunningState::new(mean);
        self.running_var = RunningState::new(var);
        self
    }
}

impl<B: Backend, T: NamedParameters<B>> NamedParameters<B> for Option<T> {
    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        self.map(|module| module.map_named(prefix, mapper))
    }
}

impl<B: Backend, T: NamedParameters<B>> NamedParameters<B> for Vec<T> {
    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        self.into_iter()
            .enumerate()
            .map(|(i, module)| module.map_named(&join(prefix, &i.to_string()), mapper))
            .collect()
    }
}
