//! Normalization layers with freezing support.
//!
//! Detection transfer commonly runs a backbone with frozen batch-norm
//! statistics, or replaces batch norm entirely with per-channel affine
//! parameters folded from a pretrained checkpoint. [`Norm`] dispatches over
//! the three forms behind one module type.

use burn::{
    module::Param,
    nn::{BatchNorm, BatchNormConfig},
    prelude::*,
};

use crate::config::NormKind;

/// Configuration for a [`Norm`] layer.
#[derive(Config, Debug)]
pub struct NormConfig {
    /// Number of channels.
    pub num_features: usize,
    /// Which normalization layer to build.
    #[config(default = "NormKind::BatchNorm")]
    pub kind: NormKind,
    /// Freeze the layer's parameters (and statistics, for batch norm).
    #[config(default = false)]
    pub frozen: bool,
}

impl NormConfig {
    /// Initialize the normalization layer the configuration describes.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Norm<B> {
        match self.kind {
            NormKind::BatchNorm | NormKind::SyncBatchNorm => {
                if self.frozen {
                    Norm::FrozenBatch(FrozenBatchNormConfig::new(self.num_features).init(device))
                } else {
                    Norm::Batch(BatchNormConfig::new(self.num_features).init(device))
                }
            }
            NormKind::AffineChannel => Norm::Affine(
                AffineChannelConfig::new(self.num_features)
                    .with_frozen(self.frozen)
                    .init(device),
            ),
        }
    }
}

/// Normalization layer applied after every backbone conv.
#[derive(Module, Debug)]
pub enum Norm<B: Backend> {
    /// Trainable batch normalization.
    Batch(BatchNorm<B, 2>),
    /// Batch normalization running on stored statistics, gradient-free.
    FrozenBatch(FrozenBatchNorm<B>),
    /// Per-channel scale and bias without running statistics.
    Affine(AffineChannel<B>),
}

impl<B: Backend> Norm<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Batch(norm) => norm.forward(input),
            Self::FrozenBatch(norm) => norm.forward(input),
            Self::Affine(norm) => norm.forward(input),
        }
    }
}

/// Configuration for [`FrozenBatchNorm`].
#[derive(Config, Debug)]
pub struct FrozenBatchNormConfig {
    /// Number of channels.
    pub num_features: usize,
    /// Stabilizer added to the variance.
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl FrozenBatchNormConfig {
    /// Initialize a frozen batch norm with identity parameters.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> FrozenBatchNorm<B> {
        FrozenBatchNorm {
            gamma: Param::from_tensor(Tensor::ones([self.num_features], device)),
            beta: Param::from_tensor(Tensor::zeros([self.num_features], device)),
            running_mean: Param::from_tensor(Tensor::zeros([self.num_features], device)),
            running_var: Param::from_tensor(Tensor::ones([self.num_features], device)),
            epsilon: self.epsilon,
        }
    }
}

/// Batch normalization whose statistics and affine parameters are fixed.
///
/// Forward computes `(x - mean) / sqrt(var + eps) * gamma + beta` from the
/// stored parameters. Nothing is updated and no gradient reaches the
/// parameters; they exist to be loaded from a pretrained record.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    /// Learned scale, frozen.
    pub gamma: Param<Tensor<B, 1>>,
    /// Learned bias, frozen.
    pub beta: Param<Tensor<B, 1>>,
    /// Stored batch mean.
    pub running_mean: Param<Tensor<B, 1>>,
    /// Stored batch variance.
    pub running_var: Param<Tensor<B, 1>>,
    /// Stabilizer added to the variance.
    pub epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = input.dims();
        let shape = [1, channels, 1, 1];

        let gamma = self.gamma.val().detach().reshape(shape);
        let beta = self.beta.val().detach().reshape(shape);
        let mean = self.running_mean.val().detach().reshape(shape);
        let var = self.running_var.val().detach().reshape(shape);

        let scale = gamma / var.add_scalar(self.epsilon).sqrt();
        input * scale.clone() + (beta - mean * scale)
    }
}

/// Configuration for [`AffineChannel`].
#[derive(Config, Debug)]
pub struct AffineChannelConfig {
    /// Number of channels.
    pub num_features: usize,
    /// Detach scale and bias from the autodiff graph.
    #[config(default = false)]
    pub frozen: bool,
}

impl AffineChannelConfig {
    /// Initialize an affine channel layer (scale 1, bias 0).
    pub fn init<B: Backend>(&self, device: &Device<B>) -> AffineChannel<B> {
        AffineChannel {
            scale: Param::from_tensor(Tensor::ones([self.num_features], device)),
            bias: Param::from_tensor(Tensor::zeros([self.num_features], device)),
            frozen: self.frozen,
        }
    }
}

/// Per-channel scale and bias, the `affine_channel` normalization of
/// detection backbones whose batch norms were folded at export time.
#[derive(Module, Debug)]
pub struct AffineChannel<B: Backend> {
    /// Per-channel scale.
    pub scale: Param<Tensor<B, 1>>,
    /// Per-channel bias.
    pub bias: Param<Tensor<B, 1>>,
    /// Whether scale and bias are detached from the autodiff graph.
    pub frozen: bool,
}

impl<B: Backend> AffineChannel<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = input.dims();
        let shape = [1, channels, 1, 1];

        let (scale, bias) = if self.frozen {
            (self.scale.val().detach(), self.bias.val().detach())
        } else {
            (self.scale.val(), self.bias.val())
        };

        input * scale.reshape(shape) + bias.reshape(shape)
    }
}
