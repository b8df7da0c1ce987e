//! Litport CLI - convert unified transformer checkpoints
//!
//! Reads a checkpoint directory holding `model_config.yaml` and
//! `lit_model.pth` (or `lit_model.safetensors`) and writes the same weights
//! under the naming and layout of the matching reference architecture.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use litport_core::{
    all_presets, convert_lit_checkpoint, inspect_lit_checkpoint, select_family, ConvertOptions,
    RopeLayout, TargetFamily,
};

/// Litport - checkpoint layout converter
///
/// Examples:
///   litport convert checkpoints/meta-llama/Llama-2-7b-hf out/llama
///   litport inspect checkpoints/tiiuae/falcon-7b
///   litport presets --family falcon
#[derive(Parser)]
#[command(
    name = "litport",
    about = "Convert unified transformer checkpoints to reference layouts",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a checkpoint directory
    Convert {
        /// Directory with the config and unified checkpoint
        checkpoint_dir: PathBuf,

        /// Directory receiving model.safetensors and the config copy
        output_dir: PathBuf,

        /// Omit lm_head.weight (defaults per model family)
        #[arg(long, value_name = "BOOL")]
        untie_weights: Option<bool>,

        /// Rotary layout of Llama-family q/k projections (rotate-half or interleaved)
        #[arg(long, value_name = "LAYOUT", default_value_t = RopeLayout::RotateHalf)]
        rope_layout: RopeLayout,

        /// Model name used to pick the target family
        #[arg(long, value_name = "NAME", env = "LITPORT_MODEL_NAME")]
        model_name: Option<String>,
    },

    /// Check a checkpoint directory without converting it
    Inspect {
        checkpoint_dir: PathBuf,

        /// Print the resolved config as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// List built-in presets and their target family
    #[command(alias = "list")]
    Presets {
        /// Only show presets converted to this family
        #[arg(long, value_name = "FAMILY")]
        family: Option<TargetFamily>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "litport_core=debug,litport_cli=debug"
    } else {
        "litport_core=info,litport_cli=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            checkpoint_dir,
            output_dir,
            untie_weights,
            rope_layout,
            model_name,
        } => {
            let options = ConvertOptions {
                untie_weights,
                rope_layout,
                model_name,
            };
            let report = convert_lit_checkpoint(&checkpoint_dir, &output_dir, &options)
                .with_context(|| format!("converting {}", checkpoint_dir.display()))?;
            println!(
                "Converted to {} layout: {} tensors, {} parameters",
                report.family, report.tensor_count, report.parameter_count
            );
            println!("  checkpoint: {}", report.checkpoint_path.display());
            println!("  config:     {}", report.config_path.display());
            if report.untie_weights {
                println!("  lm_head.weight omitted (tied to the embedding)");
            }
        }
        Commands::Inspect {
            checkpoint_dir,
            yaml,
        } => {
            let summary = inspect_lit_checkpoint(&checkpoint_dir)
                .with_context(|| format!("inspecting {}", checkpoint_dir.display()))?;
            let config = summary.config.resolve();
            println!("Model:          {}", config.name);
            println!("Target family:  {}", summary.rule.family);
            println!("Untie default:  {}", summary.rule.untie_weights);
            println!(
                "Attention:      {} heads, {} query groups ({} per group), head size {}",
                config.n_head,
                config.n_query_groups(),
                config.q_per_kv(),
                config.head_size()
            );
            println!("Layers:         {}", config.n_layer);
            println!("Tensors:        {}", summary.tensor_count);
            println!("Parameters:     {}", summary.parameter_count);
            if yaml {
                println!();
                print!("{}", config.to_yaml()?);
            }
        }
        Commands::Presets { family } => {
            println!("{:<36} {:<10} {:>7} {:>7}", "PRESET", "FAMILY", "HEADS", "GROUPS");
            for preset in all_presets() {
                let rule = select_family(&preset.name);
                if family.is_some_and(|f| f != rule.family) {
                    continue;
                }
                println!(
                    "{:<36} {:<10} {:>7} {:>7}",
                    preset.name,
                    rule.family.as_str(),
                    preset.n_head,
                    preset.n_query_groups()
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "litport",
            "convert",
            "in",
            "out",
            "--untie-weights",
            "false",
            "--rope-layout",
            "interleaved",
            "--model-name",
            "gemma-2b",
        ])
        .unwrap();
        match cli.command {
            Commands::Convert {
                untie_weights,
                rope_layout,
                model_name,
                ..
            } => {
                assert_eq!(untie_weights, Some(false));
                assert_eq!(rope_layout, RopeLayout::Interleaved);
                assert_eq!(model_name.as_deref(), Some("gemma-2b"));
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn rope_layout_defaults_and_rejects_unknown() {
        let cli = Cli::try_parse_from(["litport", "convert", "in", "out"]).unwrap();
        match cli.command {
            Commands::Convert { rope_layout, .. } => {
                assert_eq!(rope_layout, RopeLayout::RotateHalf)
            }
            _ => panic!("expected convert"),
        }
        assert!(
            Cli::try_parse_from(["litport", "convert", "in", "out", "--rope-layout", "spiral"])
                .is_err()
        );
    }

    #[test]
    fn presets_filter_parses_family() {
        let cli = Cli::try_parse_from(["litport", "presets", "--family", "gpt-neox"]).unwrap();
        match cli.command {
            Commands::Presets { family } => assert_eq!(family, Some(TargetFamily::GptNeoX)),
            _ => panic!("expected presets"),
        }
        assert!(Cli::try_parse_from(["litport", "list", "--family", "bert"]).is_err());
    }
}
