//! The assembled backbone: stem, residual stages, endpoints and the
//! optional classification head.

use burn::{
    nn::{
        pool::{
            AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig,
        },
        Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
};

use crate::{
    blocks::{stage_input_channels, stage_output_channels, Stage, STEM_CHANNELS},
    config::{Depth, ResNetConfig},
    conv::{ConvNorm, ConvNormConfig},
    error::BackboneResult,
};

/// Input stem: the convolutions and max pool ahead of the residual stages.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    /// One 7x7 conv, or three 3x3 convs for deep-stem variants.
    pub convs: Vec<ConvNorm<B>>,
    /// Halves the resolution a second time.
    pub pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn new(config: &ResNetConfig, device: &Device<B>) -> Self {
        let stem_conv = |in_channels: usize, out_channels: usize, kernel: usize, stride: usize| {
            ConvNormConfig::new(in_channels, out_channels, kernel)
                .with_stride(stride)
                .with_activation(true)
                .with_norm_kind(config.norm_kind.clone())
                .with_freeze_norm(config.freeze_norm)
                .init(device)
        };
        let convs = if config.variant.deep_stem() {
            let mid = STEM_CHANNELS / 2;
            vec![
                stem_conv(3, mid, 3, 2),
                stem_conv(mid, mid, 3, 1),
                stem_conv(mid, STEM_CHANNELS, 3, 1),
            ]
        } else {
            vec![stem_conv(3, STEM_CHANNELS, 7, 2)]
        };

        // 3x3 maxpool, stride=2, padding=1
        let pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self { convs, pool }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for conv in &self.convs {
            out = conv.forward(out);
        }
        self.pool.forward(out)
    }
}

/// Classification head: global average pool and a fully connected layer.
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> Head<B> {
    fn new(in_channels: usize, num_classes: usize, device: &Device<B>) -> Self {
        let bound = 1.0 / (in_channels as f64).sqrt();
        let fc = LinearConfig::new(in_channels, num_classes)
            .with_initializer(Initializer::Uniform {
                min: -bound,
                max: bound,
            })
            .init(device);

        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let out = self.pool.forward(input);
        // Reshape [B, C, 1, 1] -> [B, C]
        let out = out.flatten(1, 3);
        self.fc.forward(out)
    }
}

/// A named backbone endpoint.
#[derive(Debug, Clone)]
pub struct Feature<B: Backend> {
    /// Source stage in 2..=5.
    pub stage: usize,
    /// The stage's post-activation output.
    pub tensor: Tensor<B, 4>,
}

impl<B: Backend> Feature<B> {
    /// Endpoint name, `res{stage}_sum`.
    pub fn name(&self) -> String {
        format!("res{}_sum", self.stage)
    }
}

/// ResNet backbone emitting named per-stage feature maps.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    /// Input stem; `None` when the backbone starts at an intermediate stage.
    pub stem: Option<Stem<B>>,
    /// Residual stages in execution order.
    pub stages: Vec<Stage<B>>,
    /// Classification head over the deepest stage.
    pub head: Option<Head<B>>,
    feature_maps: Vec<usize>,
    freeze_at: usize,
    lr_mult_list: [f64; 5],
}

impl<B: Backend> ResNet<B> {
    /// Forward pass that collects the configured stage endpoints in
    /// ascending stage order.
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Feature<B>> {
        let mut out = match &self.stem {
            Some(stem) => stem.forward(input),
            None => input,
        };

        let mut features = Vec::with_capacity(self.feature_maps.len());
        for stage in &self.stages {
            out = stage.forward(out);
            // Frozen stages leave the autodiff graph before they are
            // recorded, so endpoints of frozen stages carry no gradient.
            if stage.stage <= self.freeze_at {
                out = out.detach();
            }
            if self.feature_maps.contains(&stage.stage) {
                features.push(Feature {
                    stage: stage.stage,
                    tensor: out.clone(),
                });
            }
        }

        features
    }

    /// Forward pass through the classification head.
    ///
    /// # Panics
    ///
    /// Panics if the backbone was built without `num_classes`.
    pub fn forward_classify(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let head = self
            .head
            .as_ref()
            .expect("forward_classify requires a backbone built with num_classes");

        let mut out = match &self.stem {
            Some(stem) => stem.forward(input),
            None => input,
        };
        for stage in &self.stages {
            out = stage.forward(out);
            if stage.stage <= self.freeze_at {
                out = out.detach();
            }
        }

        head.forward(out)
    }

    /// Learning-rate multiplier of a depth level, for per-group optimizers.
    ///
    /// Level 1 is the stem, levels 2..=5 the residual stages.
    ///
    /// # Panics
    ///
    /// Panics if `level` is outside `1..=5`.
    pub fn lr_multiplier(&self, level: usize) -> f64 {
        assert!(
            (1..=5).contains(&level),
            "lr_multiplier takes a depth level in 1..=5, got {level}"
        );
        self.lr_mult_list[level - 1]
    }

    /// Create ResNet-18 backbone.
    pub fn resnet18(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D18), device)
    }

    /// Create ResNet-34 backbone.
    pub fn resnet34(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D34), device)
    }

    /// Create ResNet-50 backbone.
    pub fn resnet50(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D50), device)
    }

    /// Create ResNet-101 backbone.
    pub fn resnet101(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D101), device)
    }

    /// Create ResNet-152 backbone.
    pub fn resnet152(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D152), device)
    }

    /// Create ResNet-200 backbone.
    pub fn resnet200(device: &Device<B>) -> Self {
        Self::new(&ResNetConfig::new().with_depth(Depth::D200), device)
    }

    fn new(config: &ResNetConfig, device: &Device<B>) -> Self {
        let first_stage = config.feature_maps.first().copied().unwrap_or(2);
        let last_stage = config.feature_maps.last().copied().unwrap_or(5);
        let start = if config.skip_stem { first_stage } else { 2 };

        let stem = (!config.skip_stem).then(|| Stem::new(config, device));

        let mut stages = Vec::with_capacity(last_stage + 1 - start);
        let mut in_channels = stage_input_channels(&config.depth, start);
        for stage in start..=last_stage {
            stages.push(Stage::new(config, stage, in_channels, device));
            in_channels = stage_output_channels(&config.depth, stage);
        }

        let head = config
            .num_classes
            .map(|num_classes| Head::new(in_channels, num_classes, device));

        Self {
            stem,
            stages,
            head,
            feature_maps: config.feature_maps.clone(),
            freeze_at: config.freeze_at,
            lr_mult_list: config.lr_mult_list,
        }
    }
}

impl ResNetConfig {
    /// Validate the configuration and initialize the backbone.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> BackboneResult<ResNet<B>> {
        self.validate()?;
        Ok(ResNet::new(self, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::ResidualBlock,
        config::{NormKind, Variant},
        norm::Norm,
    };
    use burn::backend::{ndarray::NdArray, Autodiff};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn resnet50_forward() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::resnet50(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 224, 224],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);

        // Check endpoint shapes for ResNet50
        assert_eq!(features.len(), 4);
        assert_eq!(features[0].tensor.dims(), [1, 256, 56, 56]); // 224/4 = 56
        assert_eq!(features[1].tensor.dims(), [1, 512, 28, 28]); // 56/2 = 28
        assert_eq!(features[2].tensor.dims(), [1, 1024, 14, 14]); // 28/2 = 14
        assert_eq!(features[3].tensor.dims(), [1, 2048, 7, 7]); // 14/2 = 7
    }

    #[test]
    fn resnet18_forward() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::resnet18(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 224, 224],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);

        // Check endpoint shapes for ResNet18 (expansion=1)
        assert_eq!(features[0].tensor.dims(), [1, 64, 56, 56]); // 224/4 = 56
        assert_eq!(features[1].tensor.dims(), [1, 128, 28, 28]); // 56/2 = 28
        assert_eq!(features[2].tensor.dims(), [1, 256, 14, 14]); // 28/2 = 14
        assert_eq!(features[3].tensor.dims(), [1, 512, 7, 7]); // 14/2 = 7
    }

    #[test]
    fn endpoints_are_named_after_their_stage() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_feature_maps(vec![3, 5])
            .init(&device)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);

        let names: Vec<String> = features.iter().map(Feature::name).collect();
        assert_eq!(names, vec!["res3_sum", "res5_sum"]);
        assert_eq!(features[0].tensor.dims(), [1, 128, 8, 8]);
        assert_eq!(features[1].tensor.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn deep_stem_splits_the_first_conv() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new()
            .with_variant(Variant::D)
            .init(&device)
            .unwrap();

        let stem = model.stem.as_ref().unwrap();
        assert_eq!(stem.convs.len(), 3);

        // Same resolution schedule as the 7x7 stem
        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        assert_eq!(features[0].tensor.dims(), [1, 256, 16, 16]);
    }

    #[test]
    fn c5_preset_runs_stage_5_alone() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::c5().init(&device).unwrap();

        assert!(model.stem.is_none());
        assert!(model.head.is_none());
        assert_eq!(model.stages.len(), 1);

        // Stage 5 of a ResNet-50 consumes the res4 feature map
        let input = Tensor::<TestBackend, 4>::random(
            [1, 1024, 14, 14],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name(), "res5_sum");
        assert_eq!(features[0].tensor.dims(), [1, 2048, 7, 7]);
    }

    #[test]
    fn classification_head_produces_logits() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_num_classes(Some(10))
            .init(&device)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        assert_eq!(model.forward_classify(input).dims(), [2, 10]);
    }

    #[test]
    #[should_panic(expected = "num_classes")]
    fn classification_requires_a_head() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::resnet18(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        model.forward_classify(input);
    }

    #[test]
    fn freeze_at_stops_gradients_through_early_stages() {
        let device = Default::default();
        let model: ResNet<TestAutodiffBackend> = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_freeze_at(2)
            .init(&device)
            .unwrap();

        let input = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        let grads = features.last().unwrap().tensor.clone().sum().backward();

        let stage_weight = |stage: &Stage<TestAutodiffBackend>| match &stage.units[0].block {
            ResidualBlock::Basic(block) => block.conv1.conv.weight.grad(&grads),
            ResidualBlock::Bottleneck(block) => block.conv1.conv.weight.grad(&grads),
        };
        assert!(stage_weight(&model.stages[0]).is_none());
        assert!(stage_weight(&model.stages[1]).is_some());

        // The stem feeds the frozen stage, so it is frozen too
        let stem = model.stem.as_ref().unwrap();
        assert!(stem.convs[0].conv.weight.grad(&grads).is_none());
    }

    #[test]
    fn freeze_norm_excludes_norm_parameters_from_training() {
        let device = Default::default();
        let model: ResNet<TestAutodiffBackend> = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_freeze_norm(true)
            .init(&device)
            .unwrap();

        let input = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        let grads = features.last().unwrap().tensor.clone().sum().backward();

        match &model.stages[1].units[0].block {
            ResidualBlock::Basic(block) => {
                assert!(block.conv1.conv.weight.grad(&grads).is_some());
                match &block.conv1.norm {
                    Norm::FrozenBatch(norm) => assert!(norm.gamma.grad(&grads).is_none()),
                    _ => panic!("Expected a frozen batch norm"),
                }
            }
            ResidualBlock::Bottleneck(_) => panic!("Expected basic blocks"),
        }
    }

    #[test]
    fn affine_channel_backbone_forward() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new()
            .with_depth(Depth::D34)
            .with_norm_kind(NormKind::AffineChannel)
            .init(&device)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        assert_eq!(features[3].tensor.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn lr_multipliers_map_stem_and_stages() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new()
            .with_lr_mult_list([0.05, 0.25, 0.5, 0.75, 1.0])
            .init(&device)
            .unwrap();

        assert_eq!(model.lr_multiplier(1), 0.05);
        assert_eq!(model.lr_multiplier(3), 0.5);
        assert_eq!(model.lr_multiplier(5), 1.0);
    }

    #[test]
    fn identical_configs_build_identical_structures() {
        let device = Default::default();
        let config = ResNetConfig::new()
            .with_variant(Variant::D)
            .with_dcn_stages(vec![5])
            .with_nonlocal_stages(vec![4])
            .with_se_stages(vec![3])
            .with_gcb_stages(vec![5]);

        let first: ResNet<TestBackend> = config.init(&device).unwrap();
        let second: ResNet<TestBackend> = config.init(&device).unwrap();

        // Only parameter init draws may differ between two builds; the
        // module layout is a pure function of the configuration.
        let layout = |model: &ResNet<TestBackend>| {
            model
                .stages
                .iter()
                .map(|stage| {
                    let units = stage
                        .units
                        .iter()
                        .map(|unit| {
                            let (deformable, se, gc, shortcut) = match &unit.block {
                                ResidualBlock::Bottleneck(block) => (
                                    block.conv2.offset_conv.is_some(),
                                    block.se.is_some(),
                                    block.gc.is_some(),
                                    block.shortcut.is_some(),
                                ),
                                ResidualBlock::Basic(block) => {
                                    (false, false, false, block.shortcut.is_some())
                                }
                            };
                            (deformable, se, gc, shortcut, unit.non_local.is_some())
                        })
                        .collect::<Vec<_>>();
                    (stage.stage, units)
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(first.stem.is_some(), second.stem.is_some());
        assert_eq!(first.head.is_some(), second.head.is_some());
        assert_eq!(layout(&first), layout(&second));
    }

    #[test]
    fn config_init_rejects_invalid_settings() {
        let device = Default::default();
        let result = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_dcn_stages(vec![5])
            .init::<TestBackend>(&device);
        assert!(result.is_err());
    }
}
