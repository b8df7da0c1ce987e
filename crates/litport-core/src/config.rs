//! Architecture configuration descriptor for the unified transformer.
//!
//! Mirrors the `model_config.yaml` written next to every unified checkpoint.
//! Fields that the unified model derives at construction time (head size,
//! query groups, padded vocabulary, MLP width) stay optional here and are read
//! through accessors that apply the same derivation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Config file names looked for inside a checkpoint directory, in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["model_config.yaml", "lit_config.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormClass {
    LayerNorm,
    #[serde(rename = "RMSNorm")]
    RmsNorm,
}

impl NormClass {
    /// Whether the norm layer carries a bias vector.
    pub fn has_bias(&self) -> bool {
        matches!(self, NormClass::LayerNorm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MlpClass {
    /// Ungated `fc` -> activation -> `proj`.
    #[serde(rename = "GptNeoxMLP")]
    GptNeox,
    /// Gated `fc_1`/`fc_2` -> `proj` (SwiGLU).
    #[serde(rename = "LLaMAMLP")]
    Llama,
    /// Gated `fc_1`/`fc_2` -> `proj` with GELU gating.
    #[serde(rename = "GemmaMLP")]
    Gemma,
    /// Routed mixture of gated experts.
    #[serde(rename = "LLaMAMoE")]
    LlamaMoe,
}

impl MlpClass {
    pub fn is_gated(&self) -> bool {
        !matches!(self, MlpClass::GptNeox)
    }

    pub fn is_moe(&self) -> bool {
        matches!(self, MlpClass::LlamaMoe)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub block_size: usize,
    pub vocab_size: usize,
    pub padding_multiple: usize,
    pub padded_vocab_size: Option<usize>,
    pub n_layer: usize,
    pub n_head: usize,
    pub head_size: Option<usize>,
    pub n_embd: usize,
    pub rotary_percentage: f64,
    pub parallel_residual: bool,
    pub bias: bool,
    pub lm_head_bias: bool,
    pub n_query_groups: Option<usize>,
    pub shared_attention_norm: bool,
    pub norm_class_name: NormClass,
    pub norm_eps: f64,
    pub mlp_class_name: MlpClass,
    pub gelu_approximate: String,
    pub intermediate_size: Option<usize>,
    pub rope_condense_ratio: usize,
    pub rope_base: usize,
    pub n_expert: usize,
    pub n_expert_per_token: usize,
    pub scale_embeddings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            block_size: 4096,
            vocab_size: 50254,
            padding_multiple: 512,
            padded_vocab_size: None,
            n_layer: 16,
            n_head: 32,
            head_size: None,
            n_embd: 4096,
            rotary_percentage: 0.25,
            parallel_residual: true,
            bias: true,
            lm_head_bias: false,
            n_query_groups: None,
            shared_attention_norm: false,
            norm_class_name: NormClass::LayerNorm,
            norm_eps: 1e-5,
            mlp_class_name: MlpClass::GptNeox,
            gelu_approximate: "none".to_string(),
            intermediate_size: None,
            rope_condense_ratio: 1,
            rope_base: 10000,
            n_expert: 0,
            n_expert_per_token: 0,
            scale_embeddings: false,
        }
    }
}

/// Optional field overrides applied on top of a preset or a loaded config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub block_size: Option<usize>,
    pub n_layer: Option<usize>,
    pub n_head: Option<usize>,
    pub n_embd: Option<usize>,
    pub head_size: Option<usize>,
    pub n_query_groups: Option<usize>,
    pub intermediate_size: Option<usize>,
    pub padded_vocab_size: Option<usize>,
    pub rotary_percentage: Option<f64>,
    pub n_expert: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(v) = self.block_size {
            config.block_size = v;
        }
        if let Some(v) = self.n_layer {
            config.n_layer = v;
        }
        if let Some(v) = self.n_head {
            config.n_head = v;
        }
        if let Some(v) = self.n_embd {
            config.n_embd = v;
        }
        if let Some(v) = self.head_size {
            config.head_size = Some(v);
        }
        if let Some(v) = self.n_query_groups {
            config.n_query_groups = Some(v);
        }
        if let Some(v) = self.intermediate_size {
            config.intermediate_size = Some(v);
        }
        if let Some(v) = self.padded_vocab_size {
            config.padded_vocab_size = Some(v);
        }
        if let Some(v) = self.rotary_percentage {
            config.rotary_percentage = v;
        }
        if let Some(v) = self.n_expert {
            config.n_expert = v;
        }
    }
}

impl Config {
    /// Per-head feature width.
    pub fn head_size(&self) -> usize {
        self.head_size
            .unwrap_or_else(|| self.n_embd.checked_div(self.n_head).unwrap_or(0))
    }

    /// Number of key/value groups; defaults to one group per head.
    pub fn n_query_groups(&self) -> usize {
        self.n_query_groups.unwrap_or(self.n_head)
    }

    /// Query heads sharing each key/value pair.
    pub fn q_per_kv(&self) -> usize {
        self.n_head / self.n_query_groups().max(1)
    }

    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size
            .unwrap_or_else(|| find_multiple(self.vocab_size, self.padding_multiple))
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.n_embd)
    }

    /// Number of leading per-head coordinates that carry rotary position.
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size() as f64) as usize
    }

    /// Rows of the fused attention projection.
    pub fn qkv_rows(&self) -> usize {
        (self.n_head + 2 * self.n_query_groups()) * self.head_size()
    }

    /// Copy with every derived field written out.
    pub fn resolve(&self) -> Self {
        Self {
            head_size: Some(self.head_size()),
            n_query_groups: Some(self.n_query_groups()),
            padded_vocab_size: Some(self.padded_vocab_size()),
            intermediate_size: Some(self.intermediate_size()),
            ..self.clone()
        }
    }

    /// Check the head/group arithmetic and MLP settings.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd == 0 || self.n_layer == 0 {
            return Err(Error::ConfigError(format!(
                "{}: n_head, n_embd and n_layer must be positive (got n_head={}, n_embd={}, n_layer={})",
                self.display_name(),
                self.n_head,
                self.n_embd,
                self.n_layer
            )));
        }
        if self.head_size.is_none() && self.n_embd % self.n_head != 0 {
            return Err(Error::ConfigError(format!(
                "{}: n_embd={} is not divisible by n_head={}",
                self.display_name(),
                self.n_embd,
                self.n_head
            )));
        }
        if self.head_size() == 0 {
            return Err(Error::ConfigError(format!(
                "{}: head_size must be positive",
                self.display_name()
            )));
        }
        let groups = self.n_query_groups();
        if groups == 0 || self.n_head % groups != 0 {
            return Err(Error::ConfigError(format!(
                "{}: n_head={} is not divisible by n_query_groups={}",
                self.display_name(),
                self.n_head,
                groups
            )));
        }
        if !(0.0..=1.0).contains(&self.rotary_percentage) {
            return Err(Error::ConfigError(format!(
                "{}: rotary_percentage={} must lie in [0, 1]",
                self.display_name(),
                self.rotary_percentage
            )));
        }
        if self.mlp_class_name.is_gated() && self.intermediate_size.is_none() {
            return Err(Error::ConfigError(format!(
                "{}: {:?} MLP requires intermediate_size",
                self.display_name(),
                self.mlp_class_name
            )));
        }
        if self.mlp_class_name.is_moe() != (self.n_expert > 0) {
            return Err(Error::ConfigError(format!(
                "{}: n_expert={} does not match MLP class {:?}",
                self.display_name(),
                self.n_expert,
                self.mlp_class_name
            )));
        }
        Ok(())
    }

    /// Parse a config file, YAML or JSON by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Config = if is_json {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Locate and parse the config stored in a checkpoint directory.
    pub fn from_checkpoint_dir(dir: &Path) -> Result<(Self, PathBuf)> {
        let path = CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                Error::ModelNotFound(format!(
                    "No {} found in {}",
                    CONFIG_FILE_NAMES.join(" or "),
                    dir.display()
                ))
            })?;
        let config = Self::from_file(&path)?;
        Ok((config, path))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(Error::from)
    }

    pub(crate) fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<unnamed config>"
        } else {
            &self.name
        }
    }
}

/// Round `n` up to the next multiple of `k`.
pub fn find_multiple(n: usize, k: usize) -> usize {
    if k == 0 || n % k == 0 {
        n
    } else {
        n + k - (n % k)
    }
}
