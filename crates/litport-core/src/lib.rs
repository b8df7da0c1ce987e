//! Litport Core - checkpoint layout conversion
//!
//! Converts checkpoints of the unified, config-parameterized transformer into
//! the naming and tensor layout of architecture-specific reference models.
//!
//! # Architecture
//!
//! - [`convert::guard`] refuses LoRA and adapter checkpoints up front
//! - [`convert::qkv`] splits the fused attention projection per query group
//! - [`convert::architectures`] holds one mapper per target family
//! - [`convert::Dispatcher`] picks the mapper from the model name
//!
//! # Example
//!
//! ```ignore
//! use litport_core::{convert_lit_checkpoint, ConvertOptions};
//!
//! let report = convert_lit_checkpoint(
//!     Path::new("checkpoints/meta-llama/Llama-2-7b-hf"),
//!     Path::new("out/Llama-2-7b-hf"),
//!     &ConvertOptions::default(),
//! )?;
//! println!("wrote {} tensors", report.tensor_count);
//! ```

pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod weights;

pub use catalog::{all_presets, parse_preset};
pub use config::{Config, ConfigOverrides, MlpClass, NormClass};
pub use convert::rope::RopeLayout;
pub use convert::{
    convert_lit_checkpoint, convert_state_dict, inspect_lit_checkpoint, select_family,
    CheckpointSummary, ConversionReport, ConvertOptions, Dispatcher, FamilyRule, TargetFamily,
    FAMILY_TABLE,
};
pub use error::{Error, Result};
pub use weights::StateDict;
