//! Residual block and stage construction.
//!
//! Stages 2 through 5 are assembled here: block repetition, stride and
//! shortcut policy per structural variant, and the injection points for
//! deformable convs, squeeze-excitation, global-context and non-local
//! blocks.

use burn::{
    nn::{
        pool::{AvgPool2d, AvgPool2dConfig},
        Relu,
    },
    prelude::*,
};

use crate::{
    config::{Depth, GlobalContextConfig, NormKind, ResNetConfig, Variant},
    conv::{ConvNorm, ConvNormConfig},
    gc::{GlobalContextBlock, GlobalContextBlockConfig},
    nonlocal::{NonLocalBlock, NonLocalBlockConfig},
    se::{SqueezeExcitation, SqueezeExcitationConfig},
};

/// Filter widths of residual stages 2..=5.
pub(crate) const STAGE_FILTERS: [usize; 4] = [64, 128, 256, 512];

/// Channels entering stage 2 from the stem.
pub(crate) const STEM_CHANNELS: usize = 64;

/// Filters of a residual stage.
pub(crate) fn stage_filters(stage: usize) -> usize {
    STAGE_FILTERS[stage - 2]
}

/// Channels a residual stage emits.
pub(crate) fn stage_output_channels(depth: &Depth, stage: usize) -> usize {
    stage_filters(stage) * depth.expansion()
}

/// Channels a residual stage consumes.
pub(crate) fn stage_input_channels(depth: &Depth, stage: usize) -> usize {
    if stage == 2 {
        STEM_CHANNELS
    } else {
        stage_output_channels(depth, stage - 1)
    }
}

/// Configuration for [`Shortcut`].
#[derive(Config, Debug)]
pub struct ShortcutConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Downsampling stride.
    #[config(default = 1)]
    pub stride: usize,
    /// Average-pool the input and project with stride 1 instead of striding
    /// the 1x1 conv (variant D).
    #[config(default = false)]
    pub pool: bool,
    /// Normalization layer kind.
    #[config(default = "NormKind::BatchNorm")]
    pub norm_kind: NormKind,
    /// Freeze the normalization layer.
    #[config(default = false)]
    pub freeze_norm: bool,
}

impl ShortcutConfig {
    /// Initialize the projection shortcut.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Shortcut<B> {
        let pool = self
            .pool
            .then(|| AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init());
        let conv = ConvNormConfig::new(self.in_channels, self.out_channels, 1)
            .with_stride(if self.pool { 1 } else { self.stride })
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);

        Shortcut { pool, conv }
    }
}

/// Projection shortcut: matches the residual branch in channels and
/// resolution with a 1x1 conv + norm, optionally average-pooling first.
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    /// Variant-D downsampling pool.
    pub pool: Option<AvgPool2d>,
    /// 1x1 projection, no activation.
    pub conv: ConvNorm<B>,
}

impl<B: Backend> Shortcut<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.pool {
            Some(pool) => {
                // The 2x2/2 pool must round up like the strided convs it
                // runs parallel to, so odd extents get a bottom/right pad.
                let [_, _, height, width] = input.dims();
                let padded = if height % 2 == 1 || width % 2 == 1 {
                    input.pad((0, width % 2, 0, height % 2), 0.0)
                } else {
                    input
                };
                pool.forward(padded)
            }
            None => input,
        };
        self.conv.forward(out)
    }
}

/// Configuration for [`BasicBlock`].
#[derive(Config, Debug)]
pub struct BasicBlockConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Stage filters; basic blocks emit exactly this many channels.
    pub filters: usize,
    /// Downsampling stride of the first 3x3 conv.
    #[config(default = 1)]
    pub stride: usize,
    /// Whether this is the first block of stage 2.
    #[config(default = false)]
    pub is_first: bool,
    /// Structural variant (decides shortcut pooling).
    #[config(default = "Variant::B")]
    pub variant: Variant,
    /// Normalization layer kind.
    #[config(default = "NormKind::BatchNorm")]
    pub norm_kind: NormKind,
    /// Freeze normalization layers.
    #[config(default = false)]
    pub freeze_norm: bool,
}

impl BasicBlockConfig {
    /// Initialize the basic block.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> BasicBlock<B> {
        let out_channels = self.filters;

        let conv1 = ConvNormConfig::new(self.in_channels, self.filters, 3)
            .with_stride(self.stride)
            .with_activation(true)
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);
        let conv2 = ConvNormConfig::new(self.filters, self.filters, 3)
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);

        // Basic-block nets also project the first residual of stage 2,
        // where channels and stride already match.
        let needs_projection =
            self.in_channels != out_channels || self.stride != 1 || self.is_first;
        let shortcut = needs_projection.then(|| {
            ShortcutConfig::new(self.in_channels, out_channels)
                .with_stride(self.stride)
                .with_pool(self.variant.pool_in_shortcut() && !self.is_first)
                .with_norm_kind(self.norm_kind.clone())
                .with_freeze_norm(self.freeze_norm)
                .init(device)
        });

        BasicBlock {
            conv1,
            conv2,
            shortcut,
            relu: Relu::new(),
        }
    }
}

/// Two 3x3 convs with a residual connection (depths 18 and 34).
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    /// First 3x3 conv, carries the stride.
    pub conv1: ConvNorm<B>,
    /// Second 3x3 conv, no activation before the add.
    pub conv2: ConvNorm<B>,
    /// Projection shortcut, `None` for identity.
    pub shortcut: Option<Shortcut<B>>,
    relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Residual branch
        let out = self.conv1.forward(input);
        let out = self.conv2.forward(out);

        // Skip connection
        let out = match &self.shortcut {
            Some(shortcut) => out + shortcut.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }
}

/// Configuration for [`BottleneckBlock`].
#[derive(Config, Debug)]
pub struct BottleneckBlockConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Stage filters; the block emits `4 * filters` channels.
    pub filters: usize,
    /// Downsampling stride; its placement follows the variant.
    #[config(default = 1)]
    pub stride: usize,
    /// Whether this is the first block of stage 2.
    #[config(default = false)]
    pub is_first: bool,
    /// Structural variant (stride placement and shortcut pooling).
    #[config(default = "Variant::B")]
    pub variant: Variant,
    /// Make the 3x3 conv deformable (DCN v2).
    #[config(default = false)]
    pub deformable: bool,
    /// Squeeze-excitation reduction, when the residual is gated.
    #[config(default = "None")]
    pub se_reduction: Option<usize>,
    /// Global-context settings, when the residual gets a context block.
    #[config(default = "None")]
    pub gcb: Option<GlobalContextConfig>,
    /// Normalization layer kind.
    #[config(default = "NormKind::BatchNorm")]
    pub norm_kind: NormKind,
    /// Freeze normalization layers.
    #[config(default = false)]
    pub freeze_norm: bool,
}

impl BottleneckBlockConfig {
    /// Initialize the bottleneck block.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> BottleneckBlock<B> {
        // Expansion = 4
        let out_channels = self.filters * 4;
        let (stride1, stride2) = self.variant.bottleneck_strides(self.stride);

        let conv1 = ConvNormConfig::new(self.in_channels, self.filters, 1)
            .with_stride(stride1)
            .with_activation(true)
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);
        let conv2 = ConvNormConfig::new(self.filters, self.filters, 3)
            .with_stride(stride2)
            .with_activation(true)
            .with_deformable(self.deformable)
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);
        let conv3 = ConvNormConfig::new(self.filters, out_channels, 1)
            .with_norm_kind(self.norm_kind.clone())
            .with_freeze_norm(self.freeze_norm)
            .init(device);

        let se = self
            .se_reduction
            .map(|reduction| {
                SqueezeExcitationConfig::new(out_channels)
                    .with_reduction(reduction)
                    .init(device)
            });
        let gc = self.gcb.as_ref().map(|gcb| {
            GlobalContextBlockConfig::new(out_channels)
                .with_ratio(gcb.ratio)
                .with_pooling(gcb.pooling.clone())
                .with_fusions(gcb.fusions.clone())
                .init(device)
        });

        let shortcut = (self.in_channels != out_channels || self.stride != 1).then(|| {
            ShortcutConfig::new(self.in_channels, out_channels)
                .with_stride(self.stride)
                .with_pool(self.variant.pool_in_shortcut() && !self.is_first)
                .with_norm_kind(self.norm_kind.clone())
                .with_freeze_norm(self.freeze_norm)
                .init(device)
        });

        BottleneckBlock {
            conv1,
            conv2,
            conv3,
            se,
            gc,
            shortcut,
            relu: Relu::new(),
        }
    }
}

/// 1x1 -> 3x3 -> 1x1 residual block with 4x channel expansion (depths >= 50).
#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
    /// Reducing 1x1 conv.
    pub conv1: ConvNorm<B>,
    /// 3x3 conv, deformable when configured.
    pub conv2: ConvNorm<B>,
    /// Expanding 1x1 conv, no activation before the add.
    pub conv3: ConvNorm<B>,
    /// Squeeze-excitation gate on the residual.
    pub se: Option<SqueezeExcitation<B>>,
    /// Global-context block on the residual.
    pub gc: Option<GlobalContextBlock<B>>,
    /// Projection shortcut, `None` for identity.
    pub shortcut: Option<Shortcut<B>>,
    relu: Relu,
}

impl<B: Backend> BottleneckBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Residual branch
        let out = self.conv1.forward(input);
        let out = self.conv2.forward(out);
        let out = self.conv3.forward(out);
        let out = match &self.se {
            Some(se) => se.forward(out),
            None => out,
        };
        let out = match &self.gc {
            Some(gc) => gc.forward(out),
            None => out,
        };

        // Skip connection
        let out = match &self.shortcut {
            Some(shortcut) => out + shortcut.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }
}

/// Either residual block form.
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    /// A basic residual block.
    Basic(BasicBlock<B>),
    /// A bottleneck residual block.
    Bottleneck(BottleneckBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }
}

/// One stage element: a residual block and its optional trailing non-local
/// block.
#[derive(Module, Debug)]
pub struct StageUnit<B: Backend> {
    /// The residual block.
    pub block: ResidualBlock<B>,
    /// Non-local block running on the unit's output.
    pub non_local: Option<NonLocalBlock<B>>,
}

impl<B: Backend> StageUnit<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.block.forward(input);
        match &self.non_local {
            Some(non_local) => non_local.forward(out),
            None => out,
        }
    }
}

/// A residual stage: the unit sequence between two downsamplings.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    /// Absolute stage id in 2..=5.
    pub stage: usize,
    /// Units in execution order.
    pub units: Vec<StageUnit<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for unit in &self.units {
            out = unit.forward(out);
        }
        out
    }

    /// Build residual stage `stage` (2..=5) by the configured policy.
    pub fn new(
        config: &ResNetConfig,
        stage: usize,
        in_channels: usize,
        device: &Device<B>,
    ) -> Self {
        let filters = stage_filters(stage);
        let block_count = config.depth.blocks()[stage - 2];
        let out_channels = stage_output_channels(&config.depth, stage);

        let deformable = config.dcn_stages.contains(&stage);
        let squeeze = config.se_stages.contains(&stage);
        let context = config.gcb_stages.contains(&stage);
        let nonlocal_period = config
            .nonlocal_stages
            .contains(&stage)
            .then(|| config.depth.nonlocal_period(stage));

        let mut units = Vec::with_capacity(block_count);
        let mut ch_in = in_channels;
        for index in 0..block_count {
            // Stage 2 keeps stride 1; the stem's max pool already halved it
            let stride = if index == 0 && stage != 2 { 2 } else { 1 };
            let is_first = stage == 2 && index == 0;

            let block = if config.depth.is_bottleneck() {
                ResidualBlock::Bottleneck(
                    BottleneckBlockConfig::new(ch_in, filters)
                        .with_stride(stride)
                        .with_is_first(is_first)
                        .with_variant(config.variant.clone())
                        .with_deformable(deformable)
                        .with_se_reduction(squeeze.then_some(config.se_reduction))
                        .with_gcb(context.then(|| config.gcb.clone()))
                        .with_norm_kind(config.norm_kind.clone())
                        .with_freeze_norm(config.freeze_norm)
                        .init(device),
                )
            } else {
                ResidualBlock::Basic(
                    BasicBlockConfig::new(ch_in, filters)
                        .with_stride(stride)
                        .with_is_first(is_first)
                        .with_variant(config.variant.clone())
                        .with_norm_kind(config.norm_kind.clone())
                        .with_freeze_norm(config.freeze_norm)
                        .init(device),
                )
            };

            let non_local = match nonlocal_period {
                Some(period) if (index + 1) % period == 0 => {
                    Some(NonLocalBlockConfig::new(out_channels).init(device))
                }
                _ => None,
            };

            units.push(StageUnit { block, non_local });
            ch_in = out_channels;
        }

        Self { stage, units }
    }
}
