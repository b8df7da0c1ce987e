//! Phi targets (phi-1.5, phi-2).
//!
//! Blocks share one norm between the parallel attention and MLP branches,
//! attention is split into biased `q_proj`/`k_proj`/`v_proj`, and the output
//! head carries a bias.

use crate::config::Config;
use crate::error::Result;
use crate::weights::StateDict;

use crate::convert::names::{BlockRole, LitParam};
use crate::convert::qkv::{qkv_split, AttentionLayout};

use super::{insert, no_counterpart, parsed_params, require_multi_head, require_ungated_mlp};

const FAMILY: &str = "Phi";

fn block_path(role: BlockRole) -> Option<&'static str> {
    Some(match role {
        BlockRole::Norm1 => "input_layernorm",
        BlockRole::AttnProj => "self_attn.dense",
        BlockRole::MlpFc => "mlp.fc1",
        BlockRole::MlpProj => "mlp.fc2",
        _ => return None,
    })
}

fn target_name(param: &LitParam) -> Option<String> {
    match *param {
        LitParam::Embedding => Some("model.embed_tokens.weight".to_string()),
        LitParam::Block { layer, role, kind } => block_path(role)
            .map(|path| format!("model.layers.{layer}.{path}.{}", kind.suffix())),
        LitParam::FinalNorm(kind) => Some(format!("model.final_layernorm.{}", kind.suffix())),
        LitParam::LmHead(kind) => Some(format!("lm_head.{}", kind.suffix())),
    }
}

/// Map a unified mapping onto Phi names.
pub fn convert(config: &Config, source: &StateDict) -> Result<StateDict> {
    require_multi_head(FAMILY, config)?;
    require_ungated_mlp(FAMILY, config)?;
    let layout = AttentionLayout::from_config(config)?;

    let mut target = StateDict::with_capacity(source.len() + 2 * config.n_layer);
    for (param, tensor) in parsed_params(source)? {
        if let LitParam::Block {
            layer,
            role: BlockRole::Qkv,
            kind,
        } = param
        {
            let (q, k, v) = qkv_split(tensor, &layout)?;
            let prefix = format!("model.layers.{layer}.self_attn");
            let suffix = kind.suffix();
            insert(&mut target, format!("{prefix}.q_proj.{suffix}"), q)?;
            insert(&mut target, format!("{prefix}.k_proj.{suffix}"), k)?;
            insert(&mut target, format!("{prefix}.v_proj.{suffix}"), v)?;
            continue;
        }
        let name = target_name(&param).ok_or_else(|| no_counterpart(FAMILY, &param))?;
        insert(&mut target, name, tensor.clone())?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::names::synthetic_state_dict;
    use crate::error::Error;
    use candle_core::{Device, Tensor};

    fn tiny_phi() -> Config {
        Config {
            name: "phi-tiny".to_string(),
            n_layer: 2,
            n_head: 4,
            n_embd: 16,
            padded_vocab_size: Some(32),
            rotary_percentage: 0.5,
            shared_attention_norm: true,
            lm_head_bias: true,
            gelu_approximate: "tanh".to_string(),
            ..Default::default()
        }
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn maps_every_name() {
        let config = tiny_phi();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source).unwrap();

        // qkv weight and bias each fan out into three tensors
        assert_eq!(target.len(), source.len() + 4 * config.n_layer);
        for name in [
            "model.embed_tokens.weight",
            "model.layers.0.input_layernorm.weight",
            "model.layers.0.input_layernorm.bias",
            "model.layers.0.self_attn.q_proj.weight",
            "model.layers.0.self_attn.k_proj.bias",
            "model.layers.0.self_attn.v_proj.bias",
            "model.layers.1.self_attn.dense.weight",
            "model.layers.1.mlp.fc1.bias",
            "model.layers.1.mlp.fc2.weight",
            "model.final_layernorm.weight",
            "model.final_layernorm.bias",
            "lm_head.weight",
            "lm_head.bias",
        ] {
            assert!(target.contains_key(name), "missing {name}");
        }
        assert_eq!(
            values(&target["lm_head.bias"]),
            values(&source["lm_head.bias"])
        );
    }

    #[test]
    fn splits_attention_per_head() {
        let config = tiny_phi();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source).unwrap();

        let hs = config.head_size();
        let fused = &source["transformer.h.1.attn.attn.bias"];
        // head 2 owns fused blocks 6 (q), 7 (k) and 8 (v)
        let q = &target["model.layers.1.self_attn.q_proj.bias"];
        let v = &target["model.layers.1.self_attn.v_proj.bias"];
        assert_eq!(
            values(&q.narrow(0, 2 * hs, hs).unwrap()),
            values(&fused.narrow(0, 6 * hs, hs).unwrap())
        );
        assert_eq!(
            values(&v.narrow(0, 2 * hs, hs).unwrap()),
            values(&fused.narrow(0, 8 * hs, hs).unwrap())
        );
    }

    #[test]
    fn second_norm_has_no_slot() {
        let config = Config {
            shared_attention_norm: false,
            ..tiny_phi()
        };
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        assert!(matches!(
            convert(&config, &source),
            Err(Error::UnexpectedParameter(_))
        ));
    }
}
