//! Squeeze-excitation channel gating.

use burn::{
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Initializer, Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{relu, sigmoid},
};

/// Configuration for [`SqueezeExcitation`].
#[derive(Config, Debug)]
pub struct SqueezeExcitationConfig {
    /// Number of channels being gated.
    pub channels: usize,
    /// Channel reduction of the bottleneck between the two FC layers.
    #[config(default = 16)]
    pub reduction: usize,
}

impl SqueezeExcitationConfig {
    /// Initialize the squeeze-excitation gate.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> SqueezeExcitation<B> {
        let squeezed = (self.channels / self.reduction).max(1);

        let bound = 1.0 / (self.channels as f64).sqrt();
        let fc1 = LinearConfig::new(self.channels, squeezed)
            .with_initializer(Initializer::Uniform {
                min: -bound,
                max: bound,
            })
            .init(device);

        let bound = 1.0 / (squeezed as f64).sqrt();
        let fc2 = LinearConfig::new(squeezed, self.channels)
            .with_initializer(Initializer::Uniform {
                min: -bound,
                max: bound,
            })
            .init(device);

        SqueezeExcitation {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1,
            fc2,
        }
    }
}

/// Channel attention: global average pool -> FC + ReLU -> FC + sigmoid ->
/// per-channel scaling of the input.
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    /// Global average pool of the squeeze step.
    pub pool: AdaptiveAvgPool2d,
    /// Reducing FC layer.
    pub fc1: Linear<B>,
    /// Expanding FC layer.
    pub fc2: Linear<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = input.dims();

        let squeezed = self.pool.forward(input.clone()).reshape([batch_size, channels]);
        let gate = relu(self.fc1.forward(squeezed));
        let gate = sigmoid(self.fc2.forward(gate));

        input * gate.reshape([batch_size, channels, 1, 1])
    }
}
