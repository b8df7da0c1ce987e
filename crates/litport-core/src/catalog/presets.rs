//! Named architecture presets and identifier parsing.

use crate::config::{Config, ConfigOverrides, MlpClass, NormClass};
use crate::error::{Error, Result};

/// Every preset the catalog knows, in listing order.
pub fn all_presets() -> Vec<Config> {
    let mut presets = Vec::new();
    presets.extend(llama_presets());
    presets.extend(falcon_presets());
    presets.extend(neox_presets());
    presets.extend(phi_presets());
    presets
}

fn llama_base(name: &str) -> Config {
    Config {
        name: name.to_string(),
        vocab_size: 32000,
        padding_multiple: 64,
        n_layer: 32,
        rotary_percentage: 1.0,
        parallel_residual: false,
        bias: false,
        norm_class_name: NormClass::RmsNorm,
        mlp_class_name: MlpClass::Llama,
        intermediate_size: Some(11008),
        ..Default::default()
    }
}

fn llama_presets() -> Vec<Config> {
    vec![
        llama_base("Llama-2-7b-hf"),
        llama_base("Llama-2-7b-chat-hf"),
        Config {
            n_layer: 80,
            n_head: 64,
            n_embd: 8192,
            n_query_groups: Some(8),
            intermediate_size: Some(28672),
            ..llama_base("Llama-2-70b-chat-hf")
        },
        Config {
            block_size: 16384,
            vocab_size: 32016,
            padding_multiple: 16,
            rope_base: 1_000_000,
            ..llama_base("CodeLlama-7b-hf")
        },
        Config {
            block_size: 32768,
            padded_vocab_size: Some(32000),
            n_query_groups: Some(8),
            mlp_class_name: MlpClass::LlamaMoe,
            intermediate_size: Some(14336),
            rope_base: 1_000_000,
            n_expert: 8,
            n_expert_per_token: 2,
            ..llama_base("Mixtral-8x7B-Instruct-v0.1")
        },
        Config {
            block_size: 2048,
            n_layer: 26,
            n_embd: 3200,
            norm_eps: 1e-6,
            intermediate_size: Some(8640),
            ..llama_base("open_llama_3b")
        },
        Config {
            vocab_size: 50254,
            padding_multiple: 512,
            n_embd: 2560,
            rotary_percentage: 0.25,
            norm_class_name: NormClass::LayerNorm,
            intermediate_size: Some(6912),
            ..llama_base("stablelm-zephyr-3b")
        },
        Config {
            block_size: 8192,
            vocab_size: 256000,
            n_layer: 18,
            n_head: 8,
            n_embd: 2048,
            head_size: Some(256),
            n_query_groups: Some(1),
            mlp_class_name: MlpClass::Gemma,
            gelu_approximate: "tanh".to_string(),
            intermediate_size: Some(16384),
            scale_embeddings: true,
            ..llama_base("gemma-2b")
        },
        Config {
            block_size: 8192,
            vocab_size: 256000,
            n_layer: 28,
            n_head: 16,
            n_embd: 3072,
            head_size: Some(256),
            mlp_class_name: MlpClass::Gemma,
            gelu_approximate: "tanh".to_string(),
            intermediate_size: Some(24576),
            scale_embeddings: true,
            ..llama_base("gemma-7b")
        },
    ]
}

fn falcon_base(name: &str) -> Config {
    Config {
        name: name.to_string(),
        block_size: 2048,
        vocab_size: 65024,
        padded_vocab_size: Some(65024),
        rotary_percentage: 1.0,
        bias: false,
        ..Default::default()
    }
}

fn falcon_presets() -> Vec<Config> {
    vec![
        Config {
            n_layer: 32,
            n_head: 71,
            n_embd: 4544,
            n_query_groups: Some(1),
            shared_attention_norm: true,
            ..falcon_base("falcon-7b")
        },
        Config {
            n_layer: 60,
            n_head: 128,
            n_embd: 8192,
            n_query_groups: Some(8),
            ..falcon_base("falcon-40b")
        },
        Config {
            n_layer: 80,
            n_head: 232,
            n_embd: 14848,
            n_query_groups: Some(8),
            ..falcon_base("falcon-180B")
        },
    ]
}

fn pythia(name: &str, n_layer: usize, n_embd: usize, n_head: usize) -> Config {
    Config {
        name: name.to_string(),
        block_size: 2048,
        padding_multiple: 128,
        n_layer,
        n_embd,
        n_head,
        ..Default::default()
    }
}

fn neox_presets() -> Vec<Config> {
    vec![
        pythia("pythia-70m", 6, 512, 8),
        pythia("pythia-160m", 12, 768, 12),
        pythia("pythia-410m", 24, 1024, 16),
        pythia("pythia-1b", 16, 2048, 8),
        Config {
            name: "RedPajama-INCITE-Base-3B-v1".to_string(),
            block_size: 2048,
            n_layer: 32,
            n_embd: 2560,
            padding_multiple: 256,
            rotary_percentage: 1.0,
            parallel_residual: false,
            ..Default::default()
        },
        Config {
            name: "stablelm-base-alpha-3b".to_string(),
            ..Default::default()
        },
        Config {
            name: "stablecode-completion-alpha-3b".to_string(),
            block_size: 16384,
            vocab_size: 49152,
            n_layer: 32,
            n_embd: 2560,
            ..Default::default()
        },
    ]
}

fn phi_presets() -> Vec<Config> {
    let phi = |name: &str, n_layer: usize, n_embd: usize, rotary: f64| Config {
        name: name.to_string(),
        block_size: 2048,
        vocab_size: 50257,
        padded_vocab_size: Some(51200),
        n_layer,
        n_head: 32,
        n_embd,
        rotary_percentage: rotary,
        shared_attention_norm: true,
        lm_head_bias: true,
        gelu_approximate: "tanh".to_string(),
        ..Default::default()
    };
    vec![phi("phi-1_5", 24, 2048, 0.5), phi("phi-2", 32, 2560, 0.4)]
}

/// Resolve a preset by name; case and punctuation are ignored.
pub fn parse_preset(input: &str) -> Result<Config> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::ModelNotFound("Unknown preset: <empty>".to_string()));
    }
    let normalized = normalize_identifier(trimmed);

    all_presets()
        .into_iter()
        .find(|preset| matches_preset_alias(preset, trimmed, &normalized))
        .ok_or_else(|| Error::ModelNotFound(format!("Unknown preset: {trimmed}")))
}

fn matches_preset_alias(preset: &Config, raw: &str, normalized: &str) -> bool {
    if preset.name.eq_ignore_ascii_case(raw) {
        return true;
    }
    // Accept "org/name" identifiers by their tail.
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    normalize_identifier(&preset.name) == normalized
        || normalize_identifier(&preset.name) == normalize_identifier(tail)
}

fn normalize_identifier(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

impl Config {
    /// Load a named preset.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::from_name_with(name, &ConfigOverrides::default())
    }

    /// Load a named preset and apply field overrides.
    pub fn from_name_with(name: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = parse_preset(name)?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_validates() {
        for preset in all_presets() {
            preset
                .validate()
                .unwrap_or_else(|e| panic!("{} failed validation: {e}", preset.name));
        }
    }

    #[test]
    fn preset_names_are_unique() {
        let presets = all_presets();
        for (i, a) in presets.iter().enumerate() {
            for b in &presets[i + 1..] {
                assert_ne!(
                    normalize_identifier(&a.name),
                    normalize_identifier(&b.name),
                    "duplicate preset {}",
                    a.name
                );
            }
        }
    }

    #[test]
    fn parse_ignores_case_and_punctuation() {
        let parsed = parse_preset("llama_2_7b_HF").unwrap();
        assert_eq!(parsed.name, "Llama-2-7b-hf");
    }

    #[test]
    fn parse_by_repo_tail() {
        let parsed = parse_preset("tiiuae/falcon-40b").unwrap();
        assert_eq!(parsed.name, "falcon-40b");
        assert_eq!(parsed.n_query_groups(), 8);
    }

    #[test]
    fn parse_unknown_is_model_not_found() {
        assert!(matches!(
            parse_preset("not-a-real-model"),
            Err(Error::ModelNotFound(_))
        ));
        assert!(matches!(parse_preset("  "), Err(Error::ModelNotFound(_))));
    }

    #[test]
    fn falcon_7b_is_multi_query() {
        let config = Config::from_name("falcon-7b").unwrap();
        assert_eq!(config.n_query_groups(), 1);
        assert_eq!(config.head_size(), 64);
        assert!(config.shared_attention_norm);
    }

    #[test]
    fn overrides_shrink_a_preset() {
        let config = Config::from_name_with(
            "Mixtral-8x7B-Instruct-v0.1",
            &ConfigOverrides {
                n_layer: Some(2),
                n_embd: Some(32),
                n_head: Some(8),
                n_query_groups: Some(2),
                intermediate_size: Some(86),
                n_expert: Some(4),
                padded_vocab_size: Some(10000),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.head_size(), 4);
        assert_eq!(config.n_expert, 4);
        assert_eq!(config.mlp_class_name, MlpClass::LlamaMoe);
        assert_eq!(config.padded_vocab_size(), 10000);
    }

    #[test]
    fn overrides_that_break_invariants_are_rejected() {
        let err = Config::from_name_with(
            "Llama-2-7b-hf",
            &ConfigOverrides {
                n_head: Some(8),
                n_query_groups: Some(3),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
