//! Refuses mappings that carry parameter-efficient fine-tuning weights.
//!
//! LoRA deltas must be merged into the base weights before conversion, and
//! adapter checkpoints have no counterpart in any target family. Detection is
//! by substring on parameter names.

use tracing::warn;

use crate::error::{Error, Result};
use crate::weights::StateDict;

pub const LORA_MARKER: &str = "lora";

pub const ADAPTER_MARKERS: [&str; 2] = ["adapter", "gating_factor"];

/// Fail if any parameter belongs to a LoRA or adapter module.
pub fn check_conversion_supported(state_dict: &StateDict) -> Result<()> {
    check_names(state_dict.keys().map(String::as_str))
}

/// Name-only form of [`check_conversion_supported`].
///
/// LoRA is reported ahead of adapters when both are present; the
/// lexicographically first offending name is quoted.
pub fn check_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut lora: Option<&str> = None;
    let mut adapter: Option<&str> = None;
    for name in names {
        if name.contains(LORA_MARKER) {
            lora = Some(lora.map_or(name, |seen| seen.min(name)));
        } else if ADAPTER_MARKERS.iter().any(|marker| name.contains(marker)) {
            adapter = Some(adapter.map_or(name, |seen| seen.min(name)));
        }
    }

    if let Some(name) = lora {
        warn!("Refusing conversion: unmerged LoRA parameter {}", name);
        return Err(Error::LoraNotMerged(format!(
            "LoRA weights cannot be converted; merge them into the base model first (found '{name}')"
        )));
    }
    if let Some(name) = adapter {
        warn!("Refusing conversion: adapter parameter {}", name);
        return Err(Error::AdapterNotSupported(format!(
            "Converting adapter models is not supported (found '{name}')"
        )));
    }
    Ok(())
}
