//! Conversion from unified checkpoints to architecture-specific layouts.
//!
//! [`Dispatcher`] is the single entry point: it unwraps a nested mapping, runs
//! the [`guard`], checks the mapping against the parameters the config
//! implies, and hands it to the mapper of the family selected from
//! [`FAMILY_TABLE`]. Nothing is written until the whole target mapping exists.

pub mod architectures;
pub mod guard;
pub mod names;
pub mod qkv;
pub mod rope;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::weights::{
    find_checkpoint, load_checkpoint, parameter_count, stage_checkpoint, stage_copy,
    unwrap_state_dict, StateDict, CONTAINER_KEY, OUTPUT_CHECKPOINT_NAME,
};

use architectures::llama::LlamaOptions;
use rope::RopeLayout;

/// Target architecture families with a mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFamily {
    /// Separate q/k/v projections; covers grouped- and multi-query models.
    Llama,
    Falcon,
    GptNeoX,
    Phi,
}

impl TargetFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFamily::Llama => "llama",
            TargetFamily::Falcon => "falcon",
            TargetFamily::GptNeoX => "gpt-neox",
            TargetFamily::Phi => "phi",
        }
    }
}

impl fmt::Display for TargetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "llama" => Ok(TargetFamily::Llama),
            "falcon" => Ok(TargetFamily::Falcon),
            "gpt-neox" | "gptneox" | "neox" => Ok(TargetFamily::GptNeoX),
            "phi" => Ok(TargetFamily::Phi),
            other => Err(Error::UnsupportedFamily(format!(
                "Unknown target family '{other}'"
            ))),
        }
    }
}

/// One row of the family table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyRule {
    /// Lowercase model-name prefix.
    pub prefix: &'static str,
    pub family: TargetFamily,
    /// Whether the target re-ties the output projection to the embedding.
    pub untie_weights: bool,
}

impl FamilyRule {
    const fn new(prefix: &'static str, family: TargetFamily) -> Self {
        Self {
            prefix,
            family,
            untie_weights: false,
        }
    }
}

/// Ordered family table; the first matching prefix wins.
pub const FAMILY_TABLE: &[FamilyRule] = &[
    FamilyRule::new("falcon", TargetFamily::Falcon),
    FamilyRule::new("pythia", TargetFamily::GptNeoX),
    FamilyRule::new("redpajama", TargetFamily::GptNeoX),
    FamilyRule::new("stablelm-base-alpha", TargetFamily::GptNeoX),
    FamilyRule::new("stablelm-tuned-alpha", TargetFamily::GptNeoX),
    FamilyRule::new("stablecode", TargetFamily::GptNeoX),
    FamilyRule::new("phi", TargetFamily::Phi),
    FamilyRule {
        prefix: "gemma",
        family: TargetFamily::Llama,
        untie_weights: true,
    },
];

/// Used when no table row matches.
pub const DEFAULT_RULE: FamilyRule = FamilyRule::new("", TargetFamily::Llama);

/// Call-site conversion options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Overrides the family table's untie default when set.
    pub untie_weights: Option<bool>,
    /// Rotary layout for Llama-family q/k projections.
    pub rope_layout: RopeLayout,
    /// Model name used for family selection instead of `config.name`.
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    table: &'a [FamilyRule],
}

impl Default for Dispatcher<'static> {
    fn default() -> Self {
        Self::new(FAMILY_TABLE)
    }
}

impl<'a> Dispatcher<'a> {
    pub fn new(table: &'a [FamilyRule]) -> Self {
        Self { table }
    }

    /// Pick the rule for a model name; `org/name` ids match on their tail.
    pub fn select(&self, model_name: &str) -> FamilyRule {
        let lower = model_name.trim().to_ascii_lowercase();
        let tail = lower.rsplit('/').next().unwrap_or(&lower);
        self.table
            .iter()
            .find(|rule| tail.starts_with(rule.prefix))
            .copied()
            .unwrap_or(DEFAULT_RULE)
    }

    /// Convert an in-memory unified mapping.
    pub fn convert(
        &self,
        config: &Config,
        source: StateDict,
        options: &ConvertOptions,
    ) -> Result<(FamilyRule, StateDict)> {
        let mut config = config.clone();
        if let Some(name) = &options.model_name {
            config.name = name.clone();
        }

        let source = unwrap_state_dict(source, CONTAINER_KEY);
        guard::check_conversion_supported(&source)?;
        names::validate_state_dict(&config, &source)?;

        let rule = self.select(&config.name);
        let untie_weights = options.untie_weights.unwrap_or(rule.untie_weights);
        info!(
            "Converting {} ({} tensors) to {} layout",
            config.display_name(),
            source.len(),
            rule.family
        );
        debug!(
            "Family rule prefix='{}', untie_weights={}",
            rule.prefix, untie_weights
        );

        let target = match rule.family {
            TargetFamily::Llama => architectures::llama::convert(
                &config,
                &source,
                &LlamaOptions {
                    untie_weights,
                    rope_layout: options.rope_layout,
                },
            )?,
            TargetFamily::Falcon => architectures::falcon::convert(&config, &source)?,
            TargetFamily::GptNeoX => architectures::gpt_neox::convert(&config, &source)?,
            TargetFamily::Phi => architectures::phi::convert(&config, &source)?,
        };

        info!("Mapped {} tensors to {} names", source.len(), target.len());
        Ok((
            FamilyRule {
                untie_weights,
                ..rule
            },
            target,
        ))
    }
}

/// Family rule the default table selects for a model name.
pub fn select_family(model_name: &str) -> FamilyRule {
    Dispatcher::default().select(model_name)
}

/// Convert an in-memory unified mapping with the default family table.
pub fn convert_state_dict(
    config: &Config,
    source: StateDict,
    options: &ConvertOptions,
) -> Result<StateDict> {
    Dispatcher::default()
        .convert(config, source, options)
        .map(|(_, target)| target)
}

/// Outcome of a checkpoint conversion.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub family: TargetFamily,
    pub untie_weights: bool,
    pub tensor_count: usize,
    pub parameter_count: usize,
    pub checkpoint_path: PathBuf,
    pub config_path: PathBuf,
}

/// Convert the unified checkpoint in `checkpoint_dir` into `output_dir`.
///
/// Writes `model.safetensors` and a copy of the config file. The output
/// directory is created if needed; earlier output there is overwritten.
pub fn convert_lit_checkpoint(
    checkpoint_dir: &Path,
    output_dir: &Path,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    let (config, source_config) = Config::from_checkpoint_dir(checkpoint_dir)?;
    let source = load_checkpoint(&find_checkpoint(checkpoint_dir)?)?;

    let (rule, target) = Dispatcher::default().convert(&config, source, options)?;

    fs::create_dir_all(output_dir).map_err(|e| {
        Error::ModelLoadError(format!(
            "Failed to create output directory {}: {}",
            output_dir.display(),
            e
        ))
    })?;
    let config_name = source_config
        .file_name()
        .ok_or_else(|| Error::ConfigError(format!("{} has no file name", source_config.display())))?;
    let config_path = output_dir.join(config_name);
    let checkpoint_path = output_dir.join(OUTPUT_CHECKPOINT_NAME);

    // Both files are staged before either lands; the checkpoint commits last.
    let staged_checkpoint = stage_checkpoint(&target, &checkpoint_path)?;
    if !same_file(&source_config, &config_path) {
        stage_copy(&source_config, &config_path)?.commit()?;
    }
    staged_checkpoint.commit()?;

    info!(
        "Saved {} checkpoint to {}",
        rule.family,
        output_dir.display()
    );
    Ok(ConversionReport {
        family: rule.family,
        untie_weights: rule.untie_weights,
        tensor_count: target.len(),
        parameter_count: parameter_count(&target),
        checkpoint_path,
        config_path,
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// What a checkpoint directory holds, checked without converting.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub config: Config,
    pub rule: FamilyRule,
    pub tensor_count: usize,
    pub parameter_count: usize,
}

/// Load a unified checkpoint and run the guard and parameter checks.
pub fn inspect_lit_checkpoint(checkpoint_dir: &Path) -> Result<CheckpointSummary> {
    let (config, _) = Config::from_checkpoint_dir(checkpoint_dir)?;
    let source = load_checkpoint(&find_checkpoint(checkpoint_dir)?)?;
    guard::check_conversion_supported(&source)?;
    names::validate_state_dict(&config, &source)?;
    Ok(CheckpointSummary {
        rule: select_family(&config.name),
        tensor_count: source.len(),
        parameter_count: parameter_count(&source),
        config,
    })
}
