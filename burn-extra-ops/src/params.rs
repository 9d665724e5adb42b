//! Loading parameters from a flat, dot-separated state dictionary.
//!
//! Pretrained checkpoints are exchanged as maps from parameter paths such as
//! `layer1.0.conv1.weight` to raw tensor data. [`LoadParams`] walks a module tree with
//! the same path layout and replaces every parameter whose key is present and whose
//! shape matches. Everything else is recorded in a [`LoadReport`].

use std::collections::{HashMap, HashSet};

use burn::{
    module::{Param, RunningState},
    nn::{
        conv::{Conv2d, ConvTranspose2d},
        BatchNorm, Linear,
    },
    prelude::*,
};

use crate::separable::{ConvLayer, DenseConv, SeparableConv};

/// Parameter path to tensor data.
pub type StateDict = HashMap<String, TensorData>;

/// Outcome of a [`ParamLoader`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys copied into the module.
    pub applied: Vec<String>,
    /// Keys the module asked for but the state dictionary lacks.
    pub missing: Vec<String>,
    /// Keys present in both with different shapes; the module keeps its value.
    pub mismatched: Vec<String>,
    /// Keys in the state dictionary that no module asked for.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// True when every requested key was applied and nothing was left over.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

/// Joins a parent path and a child name with a dot.
pub fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

pub struct ParamLoader<'a, B: Backend> {
    state: &'a StateDict,
    device: B::Device,
    consumed: HashSet<&'a str>,
    report: LoadReport,
}

impl<'a, B: Backend> ParamLoader<'a, B> {
    pub fn new(state: &'a StateDict, device: &B::Device) -> Self {
        Self {
            state,
            device: device.clone(),
            consumed: HashSet::new(),
            report: LoadReport::default(),
        }
    }

    fn tensor<const D: usize>(&mut self, key: &str, expected: [usize; D]) -> Option<Tensor<B, D>> {
        let state: &'a StateDict = self.state;
        let Some((stored_key, data)) = state.get_key_value(key) else {
            self.report.missing.push(key.to_string());
            return None;
        };
        self.consumed.insert(stored_key.as_str());

        if data.shape.as_slice() != expected.as_slice() {
            tracing::warn!(
                key,
                expected = ?expected,
                found = ?data.shape,
                "shape mismatch, keeping initialized value"
            );
            self.report.mismatched.push(key.to_string());
            return None;
        }

        self.report.applied.push(key.to_string());
        Some(Tensor::from_data(data.clone(), &self.device))
    }

    /// Replaces a parameter with the stored value at `key`, if it fits.
    pub fn param<const D: usize>(
        &mut self,
        key: &str,
        param: Param<Tensor<B, D>>,
    ) -> Param<Tensor<B, D>> {
        let expected = param.val().dims();
        match self.tensor(key, expected) {
            Some(tensor) => param.map(|_| tensor),
            None => param,
        }
    }

    /// Like [`ParamLoader::param`] for optional parameters such as biases.
    pub fn optional_param<const D: usize>(
        &mut self,
        key: &str,
        param: Option<Param<Tensor<B, D>>>,
    ) -> Option<Param<Tensor<B, D>>> {
        param.map(|param| self.param(key, param))
    }

    /// Loads a linear weight stored as `[out, in]` into Burn's `[in, out]` layout.
    pub fn linear_weight(&mut self, key: &str, param: Param<Tensor<B, 2>>) -> Param<Tensor<B, 2>> {
        let [d_input, d_output] = param.val().dims();
        match self.tensor(key, [d_output, d_input]) {
            Some(tensor) => param.map(|_| tensor.transpose()),
            None => param,
        }
    }

    /// Replaces a running statistic with the stored value at `key`, if it fits.
    pub fn running<const D: usize>(
        &mut self,
        key: &str,
        state: RunningState<Tensor<B, D>>,
    ) -> RunningState<Tensor<B, D>> {
        let expected = state.value().dims();
        match self.tensor(key, expected) {
            Some(tensor) => RunningState::new(tensor),
            None => state,
        }
    }

    /// Marks `key` as known without loading it.
    pub fn skip(&mut self, key: &str) {
        let state: &'a StateDict = self.state;
        if let Some((stored_key, _)) = state.get_key_value(key) {
            self.consumed.insert(stored_key.as_str());
        }
    }

    pub fn finish(self) -> LoadReport {
        let Self {
            state,
            consumed,
            mut report,
            ..
        } = self;
        report.unexpected = state
            .keys()
            .filter(|key| !consumed.contains(key.as_str()))
            .cloned()
            .collect();
        report.unexpected.sort();
        report
    }
}

/// Modules whose parameters can be filled from a [`StateDict`].
pub trait LoadParams<B: Backend>: Sized {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self;
}

/// Loads `module` from `state` and reports what happened.
pub fn load_state_dict<B: Backend, M: LoadParams<B>>(
    module: M,
    state: &StateDict,
    device: &B::Device,
) -> (M, LoadReport) {
    let mut loader = ParamLoader::new(state, device);
    let module = module.load_params("", &mut loader);
    let report = loader.finish();
    tracing::info!(
        applied = report.applied.len(),
        missing = report.missing.len(),
        mismatched = report.mismatched.len(),
        unexpected = report.unexpected.len(),
        "loaded state dict"
    );
    (module, report)
}

impl<B: Backend> LoadParams<B> for Conv2d<B> {
    fn load_params(mut self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.weight = loader.param(&join_path(path, "weight"), self.weight);
        self.bias = loader.optional_param(&join_path(path, "bias"), self.bias);
        self
    }
}

impl<B: Backend> LoadParams<B> for ConvTranspose2d<B> {
    fn load_params(mut self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.weight = loader.param(&join_path(path, "weight"), self.weight);
        self.bias = loader.optional_param(&join_path(path, "bias"), self.bias);
        self
    }
}

impl<B: Backend> LoadParams<B> for BatchNorm<B, 2> {
    fn load_params(mut self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.gamma = loader.param(&join_path(path, "weight"), self.gamma);
        self.beta = loader.param(&join_path(path, "bias"), self.beta);
        self.running_mean = loader.running(&join_path(path, "running_mean"), self.running_mean);
        self.running_var = loader.running(&join_path(path, "running_var"), self.running_var);
        loader.skip(&join_path(path, "num_batches_tracked"));
        self
    }
}

impl<B: Backend> LoadParams<B> for Linear<B> {
    fn load_params(mut self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.weight = loader.linear_weight(&join_path(path, "weight"), self.weight);
        self.bias = loader.optional_param(&join_path(path, "bias"), self.bias);
        self
    }
}

impl<B: Backend> LoadParams<B> for DenseConv<B> {
    fn load_params(mut self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.conv = self.conv.load_params(path, loader);
        self
    }
}

impl<B: Backend> LoadParams<B> for SeparableConv<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            body: self.body.load_params(&join_path(path, "body"), loader),
        }
    }
}

impl<B: Backend> LoadParams<B> for ConvLayer<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        match self {
            Self::Dense(conv) => Self::Dense(conv.load_params(path, loader)),
            Self::Separable(conv) => Self::Separable(conv.load_params(path, loader)),
        }
    }
}

impl<B: Backend, M: LoadParams<B>> LoadParams<B> for Option<M> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.map(|module| module.load_params(path, loader))
    }
}

impl<B: Backend, M: LoadParams<B>> LoadParams<B> for Vec<M> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.into_iter()
            .enumerate()
            .map(|(index, module)| module.load_params(&join_path(path, &index.to_string()), loader))
            .collect()
    }
}
