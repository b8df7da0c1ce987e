//! Llama-family targets (Llama 2, Code Llama, Mistral/Mixtral, Gemma, ...).
//!
//! Attention is stored as separate `q_proj`/`k_proj`/`v_proj`, which makes the
//! family the natural home for grouped-query and multi-query checkpoints.

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::weights::StateDict;

use crate::convert::names::{BlockRole, LitParam, ParamKind};
use crate::convert::qkv::{qkv_split, AttentionLayout};
use crate::convert::rope::{RopeLayout, RotaryPermutation};

use super::{insert, no_counterpart, parsed_params};

const FAMILY: &str = "Llama";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlamaOptions {
    /// Drop `lm_head.weight`; the target re-ties it to the embedding.
    pub untie_weights: bool,
    /// Rotary layout the target expects for q/k rows.
    pub rope_layout: RopeLayout,
}

fn block_path(role: BlockRole) -> Option<String> {
    Some(match role {
        BlockRole::Norm1 => "input_layernorm".to_string(),
        BlockRole::Norm2 => "post_attention_layernorm".to_string(),
        BlockRole::AttnProj => "self_attn.o_proj".to_string(),
        BlockRole::MlpFc1 => "mlp.gate_proj".to_string(),
        BlockRole::MlpFc2 => "mlp.up_proj".to_string(),
        BlockRole::MlpProj => "mlp.down_proj".to_string(),
        BlockRole::MoeGate => "block_sparse_moe.gate".to_string(),
        BlockRole::ExpertFc1(e) => format!("block_sparse_moe.experts.{e}.w1"),
        BlockRole::ExpertFc2(e) => format!("block_sparse_moe.experts.{e}.w3"),
        BlockRole::ExpertProj(e) => format!("block_sparse_moe.experts.{e}.w2"),
        BlockRole::Qkv | BlockRole::MlpFc => return None,
    })
}

fn target_name(param: &LitParam) -> Option<String> {
    match *param {
        LitParam::Embedding => Some("model.embed_tokens.weight".to_string()),
        LitParam::Block { layer, role, kind } => {
            block_path(role).map(|path| format!("model.layers.{layer}.{path}.{}", kind.suffix()))
        }
        LitParam::FinalNorm(kind) => Some(format!("model.norm.{}", kind.suffix())),
        LitParam::LmHead(kind) => Some(format!("lm_head.{}", kind.suffix())),
    }
}

/// Map a unified mapping onto Llama-family names.
pub fn convert(config: &Config, source: &StateDict, options: &LlamaOptions) -> Result<StateDict> {
    if !config.mlp_class_name.is_gated() {
        return Err(Error::UnsupportedFamily(format!(
            "{FAMILY} checkpoints need a gated MLP, {} uses {:?}",
            config.display_name(),
            config.mlp_class_name
        )));
    }
    let layout = AttentionLayout::from_config(config)?;
    let rope = RotaryPermutation::between(
        RopeLayout::RotateHalf,
        options.rope_layout,
        layout.head_size,
        config.rope_n_elem(),
    )?;
    if rope.is_some() {
        debug!(
            "Permuting q/k rows to {} rotary layout ({} of {} coordinates)",
            options.rope_layout,
            config.rope_n_elem(),
            layout.head_size
        );
    }

    let mut target = StateDict::with_capacity(source.len() + 2 * config.n_layer);
    for (param, tensor) in parsed_params(source)? {
        match param {
            LitParam::LmHead(ParamKind::Weight) if options.untie_weights => {
                debug!("Omitting lm_head.weight; the target ties it to the embedding");
            }
            LitParam::Block {
                layer,
                role: BlockRole::Qkv,
                kind,
            } => {
                let (q, k, v) = qkv_split(tensor, &layout)?;
                let (q, k) = match &rope {
                    Some(perm) => (
                        perm.apply(&q, layout.n_head)?,
                        perm.apply(&k, layout.n_query_groups)?,
                    ),
                    None => (q, k),
                };
                let prefix = format!("model.layers.{layer}.self_attn");
                let suffix = kind.suffix();
                insert(&mut target, format!("{prefix}.q_proj.{suffix}"), q)?;
                insert(&mut target, format!("{prefix}.k_proj.{suffix}"), k)?;
                insert(&mut target, format!("{prefix}.v_proj.{suffix}"), v)?;
            }
            other => {
                let name = target_name(&other).ok_or_else(|| no_counterpart(FAMILY, &other))?;
                insert(&mut target, name, tensor.clone())?;
            }
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MlpClass, NormClass};
    use crate::convert::names::synthetic_state_dict;
    use candle_core::{Device, Tensor};

    fn tiny_gqa() -> Config {
        Config {
            name: "Llama-2-tiny".to_string(),
            n_layer: 2,
            n_head: 4,
            n_embd: 16,
            n_query_groups: Some(2),
            padded_vocab_size: Some(32),
            rotary_percentage: 1.0,
            parallel_residual: false,
            bias: false,
            norm_class_name: NormClass::RmsNorm,
            mlp_class_name: MlpClass::Llama,
            intermediate_size: Some(24),
            ..Default::default()
        }
    }

    fn assert_same(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn maps_every_name() {
        let config = tiny_gqa();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source, &LlamaOptions::default()).unwrap();

        // qkv fans out into three tensors per layer
        assert_eq!(target.len(), source.len() + 2 * config.n_layer);
        for name in [
            "model.embed_tokens.weight",
            "model.layers.0.input_layernorm.weight",
            "model.layers.1.post_attention_layernorm.weight",
            "model.layers.1.self_attn.q_proj.weight",
            "model.layers.1.self_attn.k_proj.weight",
            "model.layers.1.self_attn.v_proj.weight",
            "model.layers.0.self_attn.o_proj.weight",
            "model.layers.0.mlp.gate_proj.weight",
            "model.layers.0.mlp.up_proj.weight",
            "model.layers.0.mlp.down_proj.weight",
            "model.norm.weight",
            "lm_head.weight",
        ] {
            assert!(target.contains_key(name), "missing {name}");
        }
        assert_same(
            &target["model.layers.0.mlp.gate_proj.weight"],
            &source["transformer.h.0.mlp.fc_1.weight"],
        );
        assert_same(
            &target["model.layers.0.mlp.up_proj.weight"],
            &source["transformer.h.0.mlp.fc_2.weight"],
        );
    }

    #[test]
    fn splits_grouped_attention() {
        let config = tiny_gqa();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source, &LlamaOptions::default()).unwrap();

        let hs = config.head_size();
        assert_eq!(
            target["model.layers.0.self_attn.q_proj.weight"].dims(),
            &[config.n_head * hs, config.n_embd]
        );
        assert_eq!(
            target["model.layers.0.self_attn.k_proj.weight"].dims(),
            &[2 * hs, config.n_embd]
        );

        // group 1's key block sits after group 0 (2 q heads, k, v) and group 1's 2 q heads
        let fused = &source["transformer.h.0.attn.attn.weight"];
        let k = &target["model.layers.0.self_attn.k_proj.weight"];
        assert_same(&k.narrow(0, hs, hs).unwrap(), &fused.narrow(0, 6 * hs, hs).unwrap());
    }

    #[test]
    fn untie_omits_lm_head() {
        let config = tiny_gqa();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let options = LlamaOptions {
            untie_weights: true,
            ..Default::default()
        };
        let target = convert(&config, &source, &options).unwrap();
        assert!(!target.contains_key("lm_head.weight"));
        assert!(target.contains_key("model.embed_tokens.weight"));
    }

    #[test]
    fn interleaved_rope_permutes_query_and_key_only() {
        let config = tiny_gqa();
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let plain = convert(&config, &source, &LlamaOptions::default()).unwrap();
        let meta = convert(
            &config,
            &source,
            &LlamaOptions {
                rope_layout: RopeLayout::Interleaved,
                ..Default::default()
            },
        )
        .unwrap();

        let perm = RotaryPermutation::rotate_half_to_interleaved(4, 4).unwrap();
        assert_same(
            &meta["model.layers.0.self_attn.q_proj.weight"],
            &perm.apply(&plain["model.layers.0.self_attn.q_proj.weight"], 4).unwrap(),
        );
        assert_same(
            &meta["model.layers.0.self_attn.k_proj.weight"],
            &perm.apply(&plain["model.layers.0.self_attn.k_proj.weight"], 2).unwrap(),
        );
        assert_same(
            &meta["model.layers.0.self_attn.v_proj.weight"],
            &plain["model.layers.0.self_attn.v_proj.weight"],
        );
    }

    #[test]
    fn maps_mixture_of_experts() {
        let config = Config {
            mlp_class_name: MlpClass::LlamaMoe,
            n_expert: 2,
            n_expert_per_token: 1,
            ..tiny_gqa()
        };
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source, &LlamaOptions::default()).unwrap();
        assert_same(
            &target["model.layers.1.block_sparse_moe.gate.weight"],
            &source["transformer.h.1.mlp.gate.weight"],
        );
        assert_same(
            &target["model.layers.1.block_sparse_moe.experts.1.w1.weight"],
            &source["transformer.h.1.mlp.experts.1.fc_1.weight"],
        );
        assert_same(
            &target["model.layers.1.block_sparse_moe.experts.1.w3.weight"],
            &source["transformer.h.1.mlp.experts.1.fc_2.weight"],
        );
        assert_same(
            &target["model.layers.1.block_sparse_moe.experts.0.w2.weight"],
            &source["transformer.h.1.mlp.experts.0.proj.weight"],
        );
    }

    #[test]
    fn carries_biases_when_present() {
        let config = Config {
            bias: true,
            norm_class_name: NormClass::LayerNorm,
            ..tiny_gqa()
        };
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let target = convert(&config, &source, &LlamaOptions::default()).unwrap();
        for name in [
            "model.layers.0.self_attn.q_proj.bias",
            "model.layers.0.self_attn.k_proj.bias",
            "model.layers.0.self_attn.v_proj.bias",
            "model.layers.0.input_layernorm.bias",
            "model.layers.0.mlp.down_proj.bias",
            "model.norm.bias",
        ] {
            assert!(target.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn rejects_ungated_mlp() {
        let config = Config {
            mlp_class_name: MlpClass::GptNeox,
            intermediate_size: None,
            ..tiny_gqa()
        };
        let source = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        assert!(matches!(
            convert(&config, &source, &LlamaOptions::default()),
            Err(Error::UnsupportedFamily(_))
        ));
    }
}
