//! Feature extraction demo.
//!
//! Builds a backbone from command-line settings, runs a random batch
//! through it and prints the resulting feature pyramid.
//!
//! ## Usage
//!
//! ```bash
//! # ResNet-50 with detection defaults
//! cargo run --bin features
//!
//! # ResNet-101-vd with deformable convs in stages 4 and 5
//! cargo run --bin features -- --depth 101 --variant d --dcn-stages 4,5
//!
//! # Frozen early stages, endpoints res4 and res5 only
//! cargo run --bin features -- --freeze-at 2 --feature-maps 4,5
//! ```

use anyhow::Result;
use burn::prelude::*;
use clap::Parser;
use resnet_backbone::ResNetConfig;
use resnet_backbone_demos::{
    create_device, parse_depth, parse_variant, SelectedBackend, BACKEND_NAME,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backbone depth (18, 34, 50, 101, 152 or 200)
    #[arg(long, default_value = "50")]
    depth: usize,

    /// Structural variant (a, b, c or d)
    #[arg(long, default_value = "b")]
    variant: String,

    /// Batch size of the random input
    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Square input resolution
    #[arg(long, default_value = "224")]
    image_size: usize,

    /// Stages to emit as endpoints
    #[arg(long, value_delimiter = ',', default_value = "2,3,4,5")]
    feature_maps: Vec<usize>,

    /// Stages receiving deformable convolutions
    #[arg(long, value_delimiter = ',')]
    dcn_stages: Vec<usize>,

    /// Stages receiving non-local blocks
    #[arg(long, value_delimiter = ',')]
    nonlocal_stages: Vec<usize>,

    /// Stages receiving squeeze-excitation
    #[arg(long, value_delimiter = ',')]
    se_stages: Vec<usize>,

    /// Stages receiving global-context blocks
    #[arg(long, value_delimiter = ',')]
    gcb_stages: Vec<usize>,

    /// Detach stages up to this number (0 disables freezing)
    #[arg(long, default_value = "0")]
    freeze_at: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ResNetConfig::new()
        .with_depth(parse_depth(args.depth)?)
        .with_variant(parse_variant(&args.variant)?)
        .with_feature_maps(args.feature_maps)
        .with_dcn_stages(args.dcn_stages)
        .with_nonlocal_stages(args.nonlocal_stages)
        .with_se_stages(args.se_stages)
        .with_gcb_stages(args.gcb_stages)
        .with_freeze_at(args.freeze_at);

    println!("Backend: {BACKEND_NAME}");
    let device = create_device();
    let model = config.init::<SelectedBackend>(&device)?;
    println!(
        "ResNet-{} variant {}: {} parameters",
        args.depth,
        args.variant.to_uppercase(),
        model.num_params()
    );

    let input = Tensor::<SelectedBackend, 4>::random(
        [args.batch_size, 3, args.image_size, args.image_size],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        &device,
    );
    for feature in model.forward(input) {
        println!("{}: {:?}", feature.name(), feature.tensor.dims());
    }

    Ok(())
}
