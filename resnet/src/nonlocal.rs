//! Non-local block: embedded-Gaussian self-attention over spatial positions.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer,
    },
    prelude::*,
    tensor::activation::softmax,
};

/// Configuration for [`NonLocalBlock`].
#[derive(Config, Debug)]
pub struct NonLocalBlockConfig {
    /// Number of channels of the wrapped feature map; the embedding space
    /// uses half of them.
    pub channels: usize,
}

impl NonLocalBlockConfig {
    /// Initialize the non-local block.
    ///
    /// Embedding convs start near zero (weights N(0, 0.01), zero bias) so a
    /// fresh block is close to an identity residual.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> NonLocalBlock<B> {
        let inner_channels = (self.channels / 2).max(1);

        let embed = |in_channels: usize, out_channels: usize| {
            let mut conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.01,
                })
                .init(device);
            conv.bias = conv.bias.map(|bias| Param::from_tensor(bias.val().zeros_like()));
            conv
        };

        NonLocalBlock {
            theta: embed(self.channels, inner_channels),
            phi: embed(self.channels, inner_channels),
            g: embed(self.channels, inner_channels),
            out: embed(inner_channels, self.channels),
            inner_channels,
        }
    }
}

/// Self-attention across all spatial positions, added residually.
///
/// Affinity between positions i and j is `softmax_j(theta(x_i) . phi(x_j))`
/// scaled by the inverse square root of the embedding width.
#[derive(Module, Debug)]
pub struct NonLocalBlock<B: Backend> {
    /// Query embedding.
    pub theta: Conv2d<B>,
    /// Key embedding.
    pub phi: Conv2d<B>,
    /// Value embedding.
    pub g: Conv2d<B>,
    /// Projection back to the full channel width.
    pub out: Conv2d<B>,
    inner_channels: usize,
}

impl<B: Backend> NonLocalBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, _, height, width] = input.dims();
        let positions = height * width;
        let inner = self.inner_channels;

        let theta = self
            .theta
            .forward(input.clone())
            .reshape([batch_size, inner, positions]);
        let phi = self
            .phi
            .forward(input.clone())
            .reshape([batch_size, inner, positions]);
        let g = self
            .g
            .forward(input.clone())
            .reshape([batch_size, inner, positions]);

        let affinity = theta.swap_dims(1, 2).matmul(phi) * (inner as f64).powf(-0.5);
        let attention = softmax(affinity, 2);

        let out = g
            .matmul(attention.swap_dims(1, 2))
            .reshape([batch_size, inner, height, width]);
        input + self.out.forward(out)
    }
}
