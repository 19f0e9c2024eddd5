//! Global-context block: one pooled context vector reshapes every position.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{relu, sigmoid, softmax},
};

use crate::config::{ContextFusion, ContextPooling};

/// Configuration for [`GlobalContextBlock`].
#[derive(Config, Debug)]
pub struct GlobalContextBlockConfig {
    /// Number of channels of the gated feature map.
    pub channels: usize,
    /// Width of the channel transform relative to `channels`.
    #[config(default = "1.0 / 16.0")]
    pub ratio: f64,
    /// How the context vector is pooled.
    #[config(default = "ContextPooling::Attention")]
    pub pooling: ContextPooling,
    /// Fusion terms to build.
    #[config(default = "vec![ContextFusion::ChannelAdd]")]
    pub fusions: Vec<ContextFusion>,
}

impl GlobalContextBlockConfig {
    /// Initialize the global-context block.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> GlobalContextBlock<B> {
        let pool = match self.pooling {
            ContextPooling::Attention => {
                ContextPool::Attention(Conv2dConfig::new([self.channels, 1], [1, 1]).init(device))
            }
            ContextPooling::Average => {
                ContextPool::Average(AdaptiveAvgPool2dConfig::new([1, 1]).init())
            }
        };

        let hidden = ((self.channels as f64 * self.ratio) as usize).max(1);
        let transform = |device: &Device<B>| ContextTransform {
            down: LinearConfig::new(self.channels, hidden).init(device),
            norm: LayerNormConfig::new(hidden).init(device),
            up: LinearConfig::new(hidden, self.channels).init(device),
        };

        GlobalContextBlock {
            pool,
            add_transform: self
                .fusions
                .contains(&ContextFusion::ChannelAdd)
                .then(|| transform(device)),
            mul_transform: self
                .fusions
                .contains(&ContextFusion::ChannelMul)
                .then(|| transform(device)),
        }
    }
}

/// Context pooling of the global-context block.
#[derive(Module, Debug)]
pub enum ContextPool<B: Backend> {
    /// Softmax attention over spatial positions from a 1x1 conv.
    Attention(Conv2d<B>),
    /// Global average pooling.
    Average(AdaptiveAvgPool2d),
}

impl<B: Backend> ContextPool<B> {
    /// Pool the feature map down to one context vector per sample.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, height, width] = input.dims();
        match self {
            Self::Attention(conv) => {
                let values = input.clone().reshape([batch_size, channels, height * width]);
                let weights = softmax(
                    conv.forward(input).reshape([batch_size, 1, height * width]),
                    2,
                );
                values
                    .matmul(weights.swap_dims(1, 2))
                    .reshape([batch_size, channels])
            }
            Self::Average(pool) => pool.forward(input).reshape([batch_size, channels]),
        }
    }
}

/// Channel transform of the global-context block.
#[derive(Module, Debug)]
pub struct ContextTransform<B: Backend> {
    /// Reducing layer.
    pub down: Linear<B>,
    /// Layer norm over the reduced channels.
    pub norm: LayerNorm<B>,
    /// Expanding layer.
    pub up: Linear<B>,
}

impl<B: Backend> ContextTransform<B> {
    pub fn forward(&self, context: Tensor<B, 2>) -> Tensor<B, 2> {
        let out = self.down.forward(context);
        let out = relu(self.norm.forward(out));
        self.up.forward(out)
    }
}

/// Lightweight long-range context: pool one context vector, transform it,
/// and fuse it back into every spatial position.
#[derive(Module, Debug)]
pub struct GlobalContextBlock<B: Backend> {
    /// Context pooling.
    pub pool: ContextPool<B>,
    /// Additive fusion transform.
    pub add_transform: Option<ContextTransform<B>>,
    /// Multiplicative (sigmoid-gated) fusion transform.
    pub mul_transform: Option<ContextTransform<B>>,
}

impl<B: Backend> GlobalContextBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = input.dims();
        let shape = [batch_size, channels, 1, 1];
        let context = self.pool.forward(input.clone());

        let mut out = input;
        if let Some(transform) = &self.mul_transform {
            let gate = sigmoid(transform.forward(context.clone())).reshape(shape);
            out = out * gate;
        }
        if let Some(transform) = &self.add_transform {
            out = out + transform.forward(context).reshape(shape);
        }
        out
    }
}
