//! ResNet backbone family for detection and classification networks.
//!
//! Builds the classic depths (18 through 200) with the structural variants
//! and feature add-ons detection systems rely on: deformable convolutions,
//! non-local blocks, squeeze-excitation, global-context blocks, frozen
//! normalization, stage freezing and per-stage learning-rate multipliers.
//! A backbone emits named per-stage feature maps (`res2_sum` .. `res5_sum`);
//! an optional head turns the deepest one into class logits.

mod backbone;
mod blocks;
mod config;
mod conv;
mod error;
mod gc;
mod nonlocal;
mod norm;
mod se;

pub use backbone::*;
pub use blocks::*;
pub use config::*;
pub use conv::*;
pub use error::*;
pub use gc::*;
pub use nonlocal::*;
pub use norm::*;
pub use se::*;
