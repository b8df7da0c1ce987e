//! Preset catalog: the configuration-loading service for named architectures.

mod presets;

pub use presets::{all_presets, parse_preset};
