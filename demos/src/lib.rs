//! Runnable demos for the ResNet backbone family.
//!
//! ## Available Demos
//!
//! - `features`: build a backbone and print its feature pyramid
//! - `classify`: attach the classification head and print logits
//!
//! ## Usage
//!
//! ```bash
//! # Feature maps of a ResNet-50-vd with deformable convs in stage 5
//! cargo run --bin features -- --depth 50 --variant d --dcn-stages 5
//!
//! # Logits of a ResNet-18 classifier
//! cargo run --bin classify -- --depth 18 --num-classes 10
//! ```

use anyhow::{bail, Result};
use burn::tensor::Device;
use cfg_if::cfg_if;
use resnet_backbone::{Depth, Variant};

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Backend the demo binaries run on.
        pub type SelectedBackend = burn::backend::Cuda;
        /// Name of the selected backend, for reporting.
        pub const BACKEND_NAME: &str = "cuda";
    } else if #[cfg(feature = "wgpu")] {
        /// Backend the demo binaries run on.
        pub type SelectedBackend = burn::backend::Wgpu;
        /// Name of the selected backend, for reporting.
        pub const BACKEND_NAME: &str = "wgpu";
    } else {
        /// Backend the demo binaries run on.
        pub type SelectedBackend = burn::backend::NdArray;
        /// Name of the selected backend, for reporting.
        pub const BACKEND_NAME: &str = "ndarray";
    }
}

/// Default device of the selected backend.
pub fn create_device() -> Device<SelectedBackend> {
    Default::default()
}

/// Parse a backbone depth given on the command line.
pub fn parse_depth(depth: usize) -> Result<Depth> {
    Ok(match depth {
        18 => Depth::D18,
        34 => Depth::D34,
        50 => Depth::D50,
        101 => Depth::D101,
        152 => Depth::D152,
        200 => Depth::D200,
        _ => bail!("unsupported depth {depth}, expected one of 18/34/50/101/152/200"),
    })
}

/// Parse a structural variant given on the command line.
pub fn parse_variant(variant: &str) -> Result<Variant> {
    Ok(match variant {
        "a" | "A" => Variant::A,
        "b" | "B" => Variant::B,
        "c" | "C" => Variant::C,
        "d" | "D" => Variant::D,
        _ => bail!("unsupported variant {variant:?}, expected one of a/b/c/d"),
    })
}
