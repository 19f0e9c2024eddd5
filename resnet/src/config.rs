//! Configuration types for the ResNet backbone family.
//!
//! Everything the backbone builder needs is resolved here: depth schedules,
//! structural variants, normalization policy, auxiliary block placement and
//! training-policy knobs (frozen stages, learning-rate multipliers).

use burn::prelude::*;

use crate::error::{BackboneError, BackboneResult};

/// Network depth, selecting the per-stage block repetition schedule.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Depth {
    /// ResNet-18 (basic blocks).
    D18,
    /// ResNet-34 (basic blocks).
    D34,
    /// ResNet-50 (bottleneck blocks).
    D50,
    /// ResNet-101 (bottleneck blocks).
    D101,
    /// ResNet-152 (bottleneck blocks).
    D152,
    /// ResNet-200 (bottleneck blocks).
    D200,
}

impl Depth {
    /// Numeric depth, for messages and reporting.
    pub const fn num_layers(&self) -> usize {
        match self {
            Self::D18 => 18,
            Self::D34 => 34,
            Self::D50 => 50,
            Self::D101 => 101,
            Self::D152 => 152,
            Self::D200 => 200,
        }
    }

    /// Block repetitions for residual stages 2 through 5.
    pub const fn blocks(&self) -> [usize; 4] {
        match self {
            Self::D18 => [2, 2, 2, 2],
            Self::D34 | Self::D50 => [3, 4, 6, 3],
            Self::D101 => [3, 4, 23, 3],
            Self::D152 => [3, 8, 36, 3],
            Self::D200 => [3, 12, 48, 3],
        }
    }

    /// Whether this depth composes bottleneck blocks (basic blocks otherwise).
    pub const fn is_bottleneck(&self) -> bool {
        matches!(self, Self::D50 | Self::D101 | Self::D152 | Self::D200)
    }

    /// Ratio of stage output channels to stage filters: 1 for basic blocks,
    /// 4 for bottleneck blocks.
    pub const fn expansion(&self) -> usize {
        if self.is_bottleneck() {
            4
        } else {
            1
        }
    }

    /// Insertion period for non-local blocks in the given stage.
    ///
    /// Stage 4 uses a depth-keyed period; every other stage uses 2.
    pub const fn nonlocal_period(&self, stage: usize) -> usize {
        if stage == 4 {
            match self {
                Self::D101 => 5,
                Self::D152 => 8,
                Self::D200 => 12,
                _ => 2,
            }
        } else {
            2
        }
    }
}

/// Structural variant of the network.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Downsampling stride on the first 1x1 conv of the bottleneck.
    A,
    /// Downsampling stride on the 3x3 conv (the common "v1.5" form).
    B,
    /// Variant B plus a deep stem of three 3x3 convs.
    C,
    /// Variant C plus an average-pool shortcut projection.
    D,
}

impl Variant {
    /// Whether the stem is three 3x3 convs instead of a single 7x7 conv.
    pub const fn deep_stem(&self) -> bool {
        matches!(self, Self::C | Self::D)
    }

    /// Whether downsampling shortcuts average-pool before their 1x1 conv.
    pub const fn pool_in_shortcut(&self) -> bool {
        matches!(self, Self::D)
    }

    /// Stride placement (first 1x1 conv, 3x3 conv) inside a bottleneck.
    pub const fn bottleneck_strides(&self, stride: usize) -> (usize, usize) {
        match self {
            Self::A => (stride, 1),
            _ => (1, stride),
        }
    }
}

/// Normalization layer selection.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum NormKind {
    /// Standard batch normalization.
    BatchNorm,
    /// Builds the same graph as [`NormKind::BatchNorm`]; cross-device
    /// statistic synchronization is a runtime concern outside this crate.
    /// The variant is kept so configurations round-trip.
    SyncBatchNorm,
    /// Per-channel scale and bias without running statistics.
    AffineChannel,
}

/// Context pooling used by the global-context block.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ContextPooling {
    /// 1x1 conv producing a softmax attention map over spatial positions.
    Attention,
    /// Global average pooling.
    Average,
}

/// Fusion applied by the global-context block.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ContextFusion {
    /// Add the transformed context to every spatial position.
    ChannelAdd,
    /// Multiply by the sigmoid of the transformed context.
    ChannelMul,
}

/// Global-context block settings shared by all configured stages.
#[derive(Config, Debug)]
pub struct GlobalContextConfig {
    /// Width of the channel transform relative to the block's channels.
    #[config(default = "1.0 / 16.0")]
    pub ratio: f64,
    /// How the context vector is pooled from the feature map.
    #[config(default = "ContextPooling::Attention")]
    pub pooling: ContextPooling,
    /// Fusion terms to apply; at least one should be listed for the block
    /// to have an effect.
    #[config(default = "vec![ContextFusion::ChannelAdd]")]
    pub fusions: Vec<ContextFusion>,
}

/// ResNet backbone configuration.
///
/// Every field is defaulted; `ResNetConfig::new()` is the plain detection
/// backbone (ResNet-50, variant B, batch norm, all four endpoints).
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Network depth.
    #[config(default = "Depth::D50")]
    pub depth: Depth,
    /// Structural variant.
    #[config(default = "Variant::B")]
    pub variant: Variant,
    /// Normalization layer used after every conv.
    #[config(default = "NormKind::BatchNorm")]
    pub norm_kind: NormKind,
    /// Freeze normalization layers: batch norm runs on its stored statistics
    /// and no norm scale/bias receives gradients.
    #[config(default = false)]
    pub freeze_norm: bool,
    /// Weight decay for norm scale/bias, surfaced to trainers through
    /// [`ResNetConfig::norm_weight_decay`].
    #[config(default = 0.0)]
    pub norm_decay: f64,
    /// Detach the outputs of stages <= `freeze_at` from the autodiff graph
    /// (0 freezes nothing, 5 freezes the whole backbone).
    #[config(default = 0)]
    pub freeze_at: usize,
    /// Stages whose outputs are returned, strictly ascending, each in 2..=5.
    #[config(default = "vec![2, 3, 4, 5]")]
    pub feature_maps: Vec<usize>,
    /// Stages whose 3x3 convs are deformable (DCN v2).
    #[config(default = "Vec::new()")]
    pub dcn_stages: Vec<usize>,
    /// Stages receiving non-local blocks.
    #[config(default = "Vec::new()")]
    pub nonlocal_stages: Vec<usize>,
    /// Stages whose bottleneck residuals get a global-context block.
    #[config(default = "Vec::new()")]
    pub gcb_stages: Vec<usize>,
    /// Global-context block settings.
    #[config(default = "GlobalContextConfig::new()")]
    pub gcb: GlobalContextConfig,
    /// Stages whose bottleneck residuals get a squeeze-excitation gate.
    #[config(default = "Vec::new()")]
    pub se_stages: Vec<usize>,
    /// Channel reduction of the squeeze-excitation bottleneck.
    #[config(default = 16)]
    pub se_reduction: usize,
    /// Learning-rate multipliers for the stem (index 0) and stages 2..=5
    /// (indices 1..=4).
    #[config(default = "[1.0, 1.0, 1.0, 1.0, 1.0]")]
    pub lr_mult_list: [f64; 5],
    /// When set, a global-average-pool + fully-connected head is built and
    /// `forward_classify` becomes available.
    #[config(default = "None")]
    pub num_classes: Option<usize>,
    /// Severed-head mode: omit the stem and treat the input tensor as the
    /// feature entering the first listed stage.
    #[config(default = false)]
    pub skip_stem: bool,
}

impl ResNetConfig {
    /// The C5 head-only backbone of two-stage detectors: stage 5 alone,
    /// running on features produced by a separately owned lower network.
    pub fn c5() -> Self {
        Self::new()
            .with_feature_maps(vec![5])
            .with_skip_stem(true)
            .with_freeze_at(2)
            .with_norm_kind(NormKind::AffineChannel)
            .with_freeze_norm(true)
    }

    /// Weight-decay policy for norm scale/bias.
    ///
    /// Returns `None` when a classification head is configured; norm decay
    /// is a detection-transfer concern.
    pub fn norm_weight_decay(&self) -> Option<f64> {
        if self.num_classes.is_some() {
            None
        } else {
            Some(self.norm_decay)
        }
    }

    /// Check the configuration for logical consistency.
    ///
    /// Returns `Err(BackboneError::InvalidConfiguration)` if any rule is
    /// violated, `Err(BackboneError::UnsupportedForDepth)` if auxiliary
    /// blocks are requested at a basic-block depth.
    pub fn validate(&self) -> BackboneResult<()> {
        if self.freeze_at > 5 {
            return Err(BackboneError::InvalidConfiguration {
                reason: format!("freeze_at must be <= 5, got {}", self.freeze_at),
            });
        }

        // A zero reduction would divide the channel count by zero when the
        // squeeze-excitation gate is built.
        if self.se_reduction == 0 {
            return Err(BackboneError::InvalidConfiguration {
                reason: "se_reduction must be at least 1".to_string(),
            });
        }

        if self.feature_maps.is_empty() {
            return Err(BackboneError::InvalidConfiguration {
                reason: "feature_maps must list at least one stage".to_string(),
            });
        }

        let out_of_range = self.feature_maps.iter().any(|stage| !(2..=5).contains(stage));
        let unsorted = self.feature_maps.windows(2).any(|pair| pair[0] >= pair[1]);
        if out_of_range || unsorted {
            return Err(BackboneError::InvalidConfiguration {
                reason: format!(
                    "feature_maps must be strictly ascending stages in 2..=5, got {:?}",
                    self.feature_maps
                ),
            });
        }

        // Without a stem the listed stages are chained directly, so they
        // must be channel-compatible neighbours.
        if self.skip_stem && self.feature_maps.windows(2).any(|pair| pair[1] != pair[0] + 1) {
            return Err(BackboneError::InvalidConfiguration {
                reason: format!(
                    "skip_stem requires consecutive feature_maps stages, got {:?}",
                    self.feature_maps
                ),
            });
        }

        for (name, stages) in [
            ("dcn_stages", &self.dcn_stages),
            ("nonlocal_stages", &self.nonlocal_stages),
            ("gcb_stages", &self.gcb_stages),
            ("se_stages", &self.se_stages),
        ] {
            if stages.iter().any(|stage| !(2..=5).contains(stage)) {
                return Err(BackboneError::InvalidConfiguration {
                    reason: format!("{name} entries must be stages in 2..=5, got {stages:?}"),
                });
            }
        }

        if !self.depth.is_bottleneck() {
            for (feature, stages) in [
                ("Deformable convolutions", &self.dcn_stages),
                ("Non-local blocks", &self.nonlocal_stages),
                ("Global-context blocks", &self.gcb_stages),
                ("Squeeze-excitation", &self.se_stages),
            ] {
                if !stages.is_empty() {
                    return Err(BackboneError::UnsupportedForDepth {
                        feature: feature.to_string(),
                        depth: self.depth.num_layers(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_block_schedules() {
        assert_eq!(Depth::D18.blocks(), [2, 2, 2, 2]);
        assert_eq!(Depth::D34.blocks(), [3, 4, 6, 3]);
        assert_eq!(Depth::D50.blocks(), [3, 4, 6, 3]);
        assert_eq!(Depth::D101.blocks(), [3, 4, 23, 3]);
        assert_eq!(Depth::D152.blocks(), [3, 8, 36, 3]);
        assert_eq!(Depth::D200.blocks(), [3, 12, 48, 3]);
    }

    #[test]
    fn depth_block_function() {
        assert!(!Depth::D18.is_bottleneck());
        assert!(!Depth::D34.is_bottleneck());
        assert!(Depth::D50.is_bottleneck());
        assert!(Depth::D200.is_bottleneck());
        assert_eq!(Depth::D34.expansion(), 1);
        assert_eq!(Depth::D101.expansion(), 4);
        assert_eq!(Depth::D152.num_layers(), 152);
    }

    #[test]
    fn nonlocal_period_is_depth_keyed_in_stage_4() {
        assert_eq!(Depth::D50.nonlocal_period(4), 2);
        assert_eq!(Depth::D101.nonlocal_period(4), 5);
        assert_eq!(Depth::D152.nonlocal_period(4), 8);
        assert_eq!(Depth::D200.nonlocal_period(4), 12);
        // Other stages always use 2
        assert_eq!(Depth::D101.nonlocal_period(3), 2);
        assert_eq!(Depth::D200.nonlocal_period(5), 2);
    }

    #[test]
    fn variant_policies() {
        assert!(!Variant::B.deep_stem());
        assert!(Variant::C.deep_stem());
        assert!(Variant::D.deep_stem());
        assert!(Variant::D.pool_in_shortcut());
        assert!(!Variant::C.pool_in_shortcut());
        assert_eq!(Variant::A.bottleneck_strides(2), (2, 1));
        assert_eq!(Variant::B.bottleneck_strides(2), (1, 2));
        assert_eq!(Variant::D.bottleneck_strides(1), (1, 1));
    }

    #[test]
    fn default_config_is_valid_detection_backbone() {
        let config = ResNetConfig::new();
        assert_eq!(config.depth, Depth::D50);
        assert_eq!(config.variant, Variant::B);
        assert_eq!(config.norm_kind, NormKind::BatchNorm);
        assert_eq!(config.feature_maps, vec![2, 3, 4, 5]);
        assert_eq!(config.freeze_at, 0);
        assert_eq!(config.lr_mult_list, [1.0; 5]);
        assert_eq!(config.num_classes, None);
        assert!(!config.skip_stem);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn c5_preset() {
        let config = ResNetConfig::c5();
        assert_eq!(config.depth, Depth::D50);
        assert_eq!(config.feature_maps, vec![5]);
        assert!(config.skip_stem);
        assert_eq!(config.freeze_at, 2);
        assert_eq!(config.norm_kind, NormKind::AffineChannel);
        assert!(config.freeze_norm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_freeze_at_out_of_range() {
        let config = ResNetConfig::new().with_freeze_at(6);
        match config.validate() {
            Err(BackboneError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("freeze_at"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn rejects_empty_feature_maps() {
        let config = ResNetConfig::new().with_feature_maps(Vec::new());
        assert!(matches!(
            config.validate(),
            Err(BackboneError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn rejects_unsorted_feature_maps() {
        let config = ResNetConfig::new().with_feature_maps(vec![2, 4, 3]);
        assert!(matches!(
            config.validate(),
            Err(BackboneError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn rejects_feature_maps_outside_residual_stages() {
        for feature_maps in [vec![1, 2], vec![5, 6]] {
            let config = ResNetConfig::new().with_feature_maps(feature_maps);
            assert!(matches!(
                config.validate(),
                Err(BackboneError::InvalidConfiguration { .. })
            ));
        }
    }

    #[test]
    fn skip_stem_requires_consecutive_stages() {
        let config = ResNetConfig::new()
            .with_skip_stem(true)
            .with_feature_maps(vec![3, 5]);
        match config.validate() {
            Err(BackboneError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("consecutive"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }

        let config = ResNetConfig::new()
            .with_skip_stem(true)
            .with_feature_maps(vec![3, 4, 5]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_se_reduction() {
        let config = ResNetConfig::new()
            .with_se_stages(vec![3])
            .with_se_reduction(0);
        match config.validate() {
            Err(BackboneError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("se_reduction"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn rejects_aux_stages_outside_range() {
        let config = ResNetConfig::new().with_dcn_stages(vec![6]);
        match config.validate() {
            Err(BackboneError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("dcn_stages"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn rejects_aux_blocks_on_basic_block_depths() {
        let config = ResNetConfig::new()
            .with_depth(Depth::D34)
            .with_dcn_stages(vec![5]);
        match config.validate() {
            Err(BackboneError::UnsupportedForDepth { depth, .. }) => assert_eq!(depth, 34),
            _ => panic!("Expected UnsupportedForDepth error"),
        }

        let config = ResNetConfig::new()
            .with_depth(Depth::D18)
            .with_nonlocal_stages(vec![4]);
        match config.validate() {
            Err(BackboneError::UnsupportedForDepth { feature, depth }) => {
                assert_eq!(depth, 18);
                assert!(feature.contains("Non-local"));
            }
            _ => panic!("Expected UnsupportedForDepth error"),
        }

        // The same stage lists are fine at bottleneck depths
        let config = ResNetConfig::new()
            .with_dcn_stages(vec![5])
            .with_nonlocal_stages(vec![4])
            .with_se_stages(vec![3])
            .with_gcb_stages(vec![4, 5]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn norm_weight_decay_suppressed_when_classifying() {
        let config = ResNetConfig::new().with_norm_decay(1e-4);
        assert_eq!(config.norm_weight_decay(), Some(1e-4));

        let config = config.with_num_classes(Some(1000));
        assert_eq!(config.norm_weight_decay(), None);
    }
}
