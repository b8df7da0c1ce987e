//! Falcon targets.
//!
//! The 7B checkpoint is multi-query with one shared attention norm; the
//! 40B/180B checkpoints use grouped-query attention with separate norms for
//! the attention and MLP branches. Both keep a fused `query_key_value`.

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::weights::StateDict;

use crate::convert::names::{BlockRole, LitParam};
use crate::convert::qkv::{pack_global, pack_grouped, qkv_split, AttentionLayout};

use super::{insert, no_counterpart, parsed_params, require_ungated_mlp};

const FAMILY: &str = "Falcon";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalconVariant {
    /// Multi-query, fused `[all q | k | v]`, single `input_layernorm`.
    SevenB,
    /// Grouped-query, fused per group, `ln_attn`/`ln_mlp`.
    NewDecoder,
}

impl FalconVariant {
    pub fn from_model_name(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.contains("7b") {
            Ok(FalconVariant::SevenB)
        } else if lower.contains("40b") || lower.contains("180b") {
            Ok(FalconVariant::NewDecoder)
        } else {
            Err(Error::UnsupportedFamily(format!(
                "No Falcon layout known for '{name}' (expected a 7b, 40b or 180B model)"
            )))
        }
    }
}

fn block_path(variant: FalconVariant, role: BlockRole) -> Option<&'static str> {
    Some(match (variant, role) {
        (FalconVariant::SevenB, BlockRole::Norm1) => "input_layernorm",
        (FalconVariant::NewDecoder, BlockRole::Norm1) => "ln_attn",
        (FalconVariant::NewDecoder, BlockRole::Norm2) => "ln_mlp",
        (_, BlockRole::AttnProj) => "self_attention.dense",
        (_, BlockRole::MlpFc) => "mlp.dense_h_to_4h",
        (_, BlockRole::MlpProj) => "mlp.dense_4h_to_h",
        _ => return None,
    })
}

fn target_name(variant: FalconVariant, param: &LitParam) -> Option<String> {
    match *param {
        LitParam::Embedding => Some("transformer.word_embeddings.weight".to_string()),
        LitParam::Block { layer, role, kind } => block_path(variant, role)
            .map(|path| format!("transformer.h.{layer}.{path}.{}", kind.suffix())),
        LitParam::FinalNorm(kind) => Some(format!("transformer.ln_f.{}", kind.suffix())),
        LitParam::LmHead(kind) => Some(format!("lm_head.{}", kind.suffix())),
    }
}

/// Map a unified mapping onto Falcon names; the variant follows `config.name`.
pub fn convert(config: &Config, source: &StateDict) -> Result<StateDict> {
    let variant = FalconVariant::from_model_name(&config.name)?;
    require_ungated_mlp(FAMILY, config)?;
    let layout = AttentionLayout::from_config(config)?;
    if variant == FalconVariant::SevenB && !layout.is_multi_query() {
        return Err(Error::UnsupportedFamily(format!(
            "Falcon 7B layout needs a single key/value group, {} has {}",
            config.display_name(),
            layout.n_query_groups
        )));
    }
    debug!("Falcon variant {:?} for {}", variant, config.display_name());

    let mut target = StateDict::with_capacity(source.len());
    for (param, tensor) in parsed_params(source)? {
        if let LitParam::Block {
            layer,
            role: BlockRole::Qkv,
            kind,
        } = param
        {
            let (q, k, v) = qkv_split(tensor, &layout)?;
            let fused = match variant {
                FalconVariant::SevenB => pack_global(&q, &k, &v, &layout)?,
                FalconVariant::NewDecoder => pack_grouped(&q, &k, &v, &layout)?,
            };
            insert(
                &mut target,
                format!("transformer.h.{layer}.self_attention.query_key_value.{}", kind.suffix()),
                fused,
            )?;
            continue;
        }
        let name = target_name(variant, &param).ok_or_else(|| no_counterpart(FAMILY, &param))?;
        insert(&mut target, name, tensor.clone())?;
    }
    Ok(target)
}
