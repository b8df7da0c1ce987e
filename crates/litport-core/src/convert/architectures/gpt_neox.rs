//! GPT-NeoX targets (Pythia, RedPajama-INCITE, StableLM-Alpha, StableCode).

use crate::config::Config;
use crate::error::Result;
use crate::weights::StateDict;

use crate::convert::names::{BlockRole, LitParam};
use crate::convert::qkv::{pack_per_head, qkv_split, AttentionLayout};

use super::{insert, no_counterpart, parsed_params, require_multi_head, require_ungated_mlp};

const FAMILY: &str = "GPT-NeoX";

fn block_path(role: BlockRole) -> Option<&'static str> {
    Some(match role {
        BlockRole::Norm1 => "input_layernorm",
        BlockRole::Norm2 => "post_attention_layernorm",
        BlockRole::Qkv => "attention.query_key_value",
        BlockRole::AttnProj => "attention.dense",
        BlockRole::MlpFc => "mlp.dense_h_to_4h",
        BlockRole::MlpProj => "mlp.dense_4h_to_h",
        _ => return None,
    })
}

fn target_name(param: &LitParam) -> Option<String> {
    match *param {
        LitParam::Embedding => Some("gpt_neox.embed_in.weight".to_string()),
        LitParam::Block { layer, role, kind } => block_path(role)
            .map(|path| format!("gpt_neox.layers.{layer}.{path}.{}", kind.suffix())),
        LitParam::FinalNorm(kind) => Some(format!("gpt_neox.final_layer_norm.{}", kind.suffix())),
        LitParam::LmHead(kind) => Some(format!("embed_out.{}", kind.suffix())),
    }
}

/// Map a unified mapping onto GPT-NeoX names.
pub fn convert(config: &Config, source: &StateDict) -> Result<StateDict> {
    require_multi_head(FAMILY, config)?;
    require_ungated_mlp(FAMILY, config)?;
    let layout = AttentionLayout::from_config(config)?;

    let mut target = StateDict::with_capacity(source.len());
    for (param, tensor) in parsed_params(source)? {
        let name = target_name(&param).ok_or_else(|| no_counterpart(FAMILY, &param))?;
        let tensor = match param {
            LitParam::Block {
                role: BlockRole::Qkv,
                ..
            } => {
                let (q, k, v) = qkv_split(tensor, &layout)?;
                pack_per_head(&q, &k, &v, &layout)?
            }
            _ => tensor.clone(),
        };
        insert(&mut target, name, tensor)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::names::synthetic_state_dict;
    use crate::error::Error;
    use candle_core::{Device, Tensor};

    fn tiny_pythia() -> Config {
        Config {
            name: "pythia-tiny".to_string(),
            n_layer: 2,
            n_head: 4,
            n_embd: 16,
            padded_vocab_size: Some(32),
            ..Default::default()
        }
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn maps_every_name_with_biases() {
        let config = tiny_pythia();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source).unwrap();

        assert_eq!(target.len(), source.len());
        for name in [
            "gpt_neox.embed_in.weight",
            "gpt_neox.layers.0.input_layernorm.weight",
            "gpt_neox.layers.0.input_layernorm.bias",
            "gpt_neox.layers.0.post_attention_layernorm.bias",
            "gpt_neox.layers.1.attention.query_key_value.weight",
            "gpt_neox.layers.1.attention.query_key_value.bias",
            "gpt_neox.layers.1.attention.dense.bias",
            "gpt_neox.layers.1.mlp.dense_h_to_4h.weight",
            "gpt_neox.layers.1.mlp.dense_4h_to_h.bias",
            "gpt_neox.final_layer_norm.weight",
            "embed_out.weight",
        ] {
            assert!(target.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn fused_attention_is_head_major() {
        let config = tiny_pythia();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source).unwrap();
        assert_eq!(
            values(&target["gpt_neox.layers.0.attention.query_key_value.weight"]),
            values(&source["transformer.h.0.attn.attn.weight"])
        );
        assert_eq!(
            values(&target["gpt_neox.layers.0.attention.query_key_value.bias"]),
            values(&source["transformer.h.0.attn.attn.bias"])
        );
    }

    #[test]
    fn rejects_grouped_query_attention() {
        let config = Config {
            n_query_groups: Some(2),
            ..tiny_pythia()
        };
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        assert!(matches!(
            convert(&config, &source),
            Err(Error::UnsupportedFamily(_))
        ));
    }
}
