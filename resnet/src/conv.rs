//! The conv + norm unit every backbone layer is assembled from.

use core::f64::consts::SQRT_2;

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{activation::sigmoid, module::deform_conv2d, ops::DeformConvOptions},
};

use crate::{
    config::NormKind,
    norm::{Norm, NormConfig},
};

/// Configuration for [`ConvNorm`].
#[derive(Config, Debug)]
pub struct ConvNormConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Square kernel size; padding is always `(kernel_size - 1) / 2`.
    pub kernel_size: usize,
    /// Conv stride.
    #[config(default = 1)]
    pub stride: usize,
    /// Conv groups.
    #[config(default = 1)]
    pub groups: usize,
    /// Apply a ReLU after the norm.
    #[config(default = false)]
    pub activation: bool,
    /// Replace the conv with a modulated deformable conv (DCN v2).
    #[config(default = false)]
    pub deformable: bool,
    /// Normalization layer kind.
    #[config(default = "NormKind::BatchNorm")]
    pub norm_kind: NormKind,
    /// Freeze the normalization layer.
    #[config(default = false)]
    pub freeze_norm: bool,
}

impl ConvNormConfig {
    /// Initialize the conv + norm unit.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvNorm<B> {
        let padding = (self.kernel_size - 1) / 2;

        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_groups(self.groups)
        .with_bias(false)
        .with_initializer(Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        })
        .init(device);

        // DCN v2: offsets and modulation mask come from companion convs that
        // start at zero, so the fresh layer samples the regular grid.
        let (offset_conv, mask_conv) = if self.deformable {
            let offset_conv = self.aux_conv(2 * self.kernel_size * self.kernel_size, device);
            let mask_conv = self.aux_conv(self.kernel_size * self.kernel_size, device);
            (Some(offset_conv), Some(mask_conv))
        } else {
            (None, None)
        };

        let norm = NormConfig::new(self.out_channels)
            .with_kind(self.norm_kind.clone())
            .with_frozen(self.freeze_norm)
            .init(device);

        ConvNorm {
            conv,
            offset_conv,
            mask_conv,
            norm,
            relu: self.activation.then(Relu::new),
            stride: self.stride,
            padding,
            groups: self.groups,
        }
    }

    fn aux_conv<B: Backend>(&self, channels: usize, device: &Device<B>) -> Conv2d<B> {
        let padding = (self.kernel_size - 1) / 2;
        let mut conv = Conv2dConfig::new(
            [self.in_channels, channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device);

        conv.weight = Param::from_tensor(conv.weight.val().zeros_like());
        conv.bias = conv.bias.map(|bias| Param::from_tensor(bias.val().zeros_like()));
        conv
    }
}

/// Conv -> norm -> optional ReLU, optionally deformable.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    /// The main conv; when deformable, only its weight (and bias) tensors
    /// are used, through `deform_conv2d`.
    pub conv: Conv2d<B>,
    /// Offset-producing conv of the deformable path.
    pub offset_conv: Option<Conv2d<B>>,
    /// Modulation-mask conv of the deformable path.
    pub mask_conv: Option<Conv2d<B>>,
    /// Normalization layer.
    pub norm: Norm<B>,
    /// Trailing activation.
    pub relu: Option<Relu>,
    stride: usize,
    padding: usize,
    groups: usize,
}

impl<B: Backend> ConvNorm<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match (&self.offset_conv, &self.mask_conv) {
            (Some(offset_conv), Some(mask_conv)) => {
                let offset = offset_conv.forward(input.clone());
                let mask = sigmoid(mask_conv.forward(input.clone()));

                deform_conv2d(
                    input,
                    offset,
                    self.conv.weight.val(),
                    Some(mask),
                    self.conv.bias.as_ref().map(Param::val),
                    DeformConvOptions {
                        stride: [self.stride, self.stride],
                        padding: [self.padding, self.padding],
                        dilation: [1, 1],
                        weight_groups: self.groups,
                        offset_groups: 1,
                    },
                )
            }
            _ => self.conv.forward(input),
        };

        let out = self.norm.forward(out);
        match &self.relu {
            Some(relu) => relu.forward(out),
            None => out,
        }
    }
}
