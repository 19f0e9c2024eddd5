//! Classification demo.
//!
//! Builds a backbone with the classification head, runs a random batch
//! through it and prints the logits and predicted classes.
//!
//! ## Usage
//!
//! ```bash
//! # ImageNet-sized ResNet-50 classifier
//! cargo run --bin classify
//!
//! # ResNet-18-vd with 10 classes
//! cargo run --bin classify -- --depth 18 --variant d --num-classes 10
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

    /// Number of output classes
    #[arg(long, default_value = "1000")]
    num_classes: usize,

    /// Batch size of the random input
    #[arg(long, default_value = "2")]
    batch_size: usize,

    /// Square input resolution
    #[arg(long, default_value = "224")]
    image_size: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ResNetConfig::new()
        .with_depth(parse_depth(args.depth)?)
        .with_variant(parse_variant(&args.variant)?)
        .with_num_classes(Some(args.num_classes));

    println!("Backend: {BACKEND_NAME}");
    let device = create_device();
    let model = config.init::<SelectedBackend>(&device)?;

    let input = Tensor::<SelectedBackend, 4>::random(
        [args.batch_size, 3, args.image_size, args.image_size],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        &device,
    );
    let logits = model.forward_classify(input);
    println!("Logits: {:?}", logits.dims());

    let predictions = logits
        .argmax(1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow::anyhow!("{err:?}"))?;
    println!("Predicted classes: {predictions:?}");

    Ok(())
}
