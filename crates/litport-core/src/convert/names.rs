//! Unified parameter names.
//!
//! Every name in a unified checkpoint is parsed into a [`LitParam`] so the
//! per-family mappers can match on roles instead of string templates.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

use crate::config::{Config, MlpClass};
use crate::error::{Error, Result};
use crate::weights::StateDict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    Weight,
    Bias,
}

impl ParamKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            ParamKind::Weight => "weight",
            ParamKind::Bias => "bias",
        }
    }

    fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "weight" => Some(ParamKind::Weight),
            "bias" => Some(ParamKind::Bias),
            _ => None,
        }
    }
}

/// Role of a parameter inside one transformer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockRole {
    Norm1,
    Norm2,
    /// Fused query/key/value projection.
    Qkv,
    AttnProj,
    /// Ungated MLP input projection.
    MlpFc,
    /// Gated MLP gate projection.
    MlpFc1,
    /// Gated MLP up projection.
    MlpFc2,
    MlpProj,
    /// Mixture-of-experts router.
    MoeGate,
    ExpertFc1(usize),
    ExpertFc2(usize),
    ExpertProj(usize),
}

impl BlockRole {
    fn path(&self) -> String {
        match self {
            BlockRole::Norm1 => "norm_1".to_string(),
            BlockRole::Norm2 => "norm_2".to_string(),
            BlockRole::Qkv => "attn.attn".to_string(),
            BlockRole::AttnProj => "attn.proj".to_string(),
            BlockRole::MlpFc => "mlp.fc".to_string(),
            BlockRole::MlpFc1 => "mlp.fc_1".to_string(),
            BlockRole::MlpFc2 => "mlp.fc_2".to_string(),
            BlockRole::MlpProj => "mlp.proj".to_string(),
            BlockRole::MoeGate => "mlp.gate".to_string(),
            BlockRole::ExpertFc1(e) => format!("mlp.experts.{e}.fc_1"),
            BlockRole::ExpertFc2(e) => format!("mlp.experts.{e}.fc_2"),
            BlockRole::ExpertProj(e) => format!("mlp.experts.{e}.proj"),
        }
    }

    fn parse(path: &str) -> Option<Self> {
        Some(match path {
            "norm_1" => BlockRole::Norm1,
            "norm_2" => BlockRole::Norm2,
            "attn.attn" => BlockRole::Qkv,
            "attn.proj" => BlockRole::AttnProj,
            "mlp.fc" => BlockRole::MlpFc,
            "mlp.fc_1" => BlockRole::MlpFc1,
            "mlp.fc_2" => BlockRole::MlpFc2,
            "mlp.proj" => BlockRole::MlpProj,
            "mlp.gate" => BlockRole::MoeGate,
            _ => {
                let (expert, sub) = path.strip_prefix("mlp.experts.")?.split_once('.')?;
                let expert = parse_index(expert)?;
                match sub {
                    "fc_1" => BlockRole::ExpertFc1(expert),
                    "fc_2" => BlockRole::ExpertFc2(expert),
                    "proj" => BlockRole::ExpertProj(expert),
                    _ => return None,
                }
            }
        })
    }
}

/// A parsed unified parameter name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LitParam {
    /// `transformer.wte.weight`
    Embedding,
    /// `transformer.h.{layer}.<role>.<kind>`
    Block {
        layer: usize,
        role: BlockRole,
        kind: ParamKind,
    },
    /// `transformer.ln_f.<kind>`
    FinalNorm(ParamKind),
    /// `lm_head.<kind>`
    LmHead(ParamKind),
}

impl LitParam {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "transformer.wte.weight" => return Some(LitParam::Embedding),
            "transformer.ln_f.weight" => return Some(LitParam::FinalNorm(ParamKind::Weight)),
            "transformer.ln_f.bias" => return Some(LitParam::FinalNorm(ParamKind::Bias)),
            "lm_head.weight" => return Some(LitParam::LmHead(ParamKind::Weight)),
            "lm_head.bias" => return Some(LitParam::LmHead(ParamKind::Bias)),
            _ => {}
        }

        let rest = name.strip_prefix("transformer.h.")?;
        let (layer, rest) = rest.split_once('.')?;
        let (path, kind) = rest.rsplit_once('.')?;
        Some(LitParam::Block {
            layer: parse_index(layer)?,
            role: BlockRole::parse(path)?,
            kind: ParamKind::parse(kind)?,
        })
    }

    pub fn name(&self) -> String {
        match self {
            LitParam::Embedding => "transformer.wte.weight".to_string(),
            LitParam::Block { layer, role, kind } => {
                format!("transformer.h.{layer}.{}.{}", role.path(), kind.suffix())
            }
            LitParam::FinalNorm(kind) => format!("transformer.ln_f.{}", kind.suffix()),
            LitParam::LmHead(kind) => format!("lm_head.{}", kind.suffix()),
        }
    }
}

fn parse_index(raw: &str) -> Option<usize> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Parse a name, reporting unknown names as unexpected parameters.
pub fn parse_param(name: &str) -> Result<LitParam> {
    LitParam::parse(name).ok_or_else(|| Error::UnexpectedParameter(name.to_string()))
}

/// Every unified parameter the config implies, with its shape.
pub fn expected_params(config: &Config) -> Vec<(LitParam, Vec<usize>)> {
    let n_embd = config.n_embd;
    let vocab = config.padded_vocab_size();
    let inter = config.intermediate_size();
    let attn_width = config.n_head * config.head_size();
    let qkv_rows = config.qkv_rows();
    let norm_bias = config.norm_class_name.has_bias();

    let mut params = vec![(LitParam::Embedding, vec![vocab, n_embd])];

    let linear = |params: &mut Vec<(LitParam, Vec<usize>)>,
                      layer: usize,
                      role: BlockRole,
                      out_dim: usize,
                      in_dim: usize,
                      bias: bool| {
        params.push((
            LitParam::Block {
                layer,
                role,
                kind: ParamKind::Weight,
            },
            vec![out_dim, in_dim],
        ));
        if bias {
            params.push((
                LitParam::Block {
                    layer,
                    role,
                    kind: ParamKind::Bias,
                },
                vec![out_dim],
            ));
        }
    };

    for layer in 0..config.n_layer {
        let norms: &[BlockRole] = if config.shared_attention_norm {
            &[BlockRole::Norm1]
        } else {
            &[BlockRole::Norm1, BlockRole::Norm2]
        };
        for &role in norms {
            params.push((
                LitParam::Block {
                    layer,
                    role,
                    kind: ParamKind::Weight,
                },
                vec![n_embd],
            ));
            if norm_bias {
                params.push((
                    LitParam::Block {
                        layer,
                        role,
                        kind: ParamKind::Bias,
                    },
                    vec![n_embd],
                ));
            }
        }

        linear(&mut params, layer, BlockRole::Qkv, qkv_rows, n_embd, config.bias);
        linear(&mut params, layer, BlockRole::AttnProj, n_embd, attn_width, config.bias);

        match config.mlp_class_name {
            MlpClass::GptNeox => {
                linear(&mut params, layer, BlockRole::MlpFc, inter, n_embd, config.bias);
                linear(&mut params, layer, BlockRole::MlpProj, n_embd, inter, config.bias);
            }
            MlpClass::Llama | MlpClass::Gemma => {
                linear(&mut params, layer, BlockRole::MlpFc1, inter, n_embd, config.bias);
                linear(&mut params, layer, BlockRole::MlpFc2, inter, n_embd, config.bias);
                linear(&mut params, layer, BlockRole::MlpProj, n_embd, inter, config.bias);
            }
            MlpClass::LlamaMoe => {
                linear(&mut params, layer, BlockRole::MoeGate, config.n_expert, n_embd, false);
                for e in 0..config.n_expert {
                    linear(&mut params, layer, BlockRole::ExpertFc1(e), inter, n_embd, config.bias);
                    linear(&mut params, layer, BlockRole::ExpertFc2(e), inter, n_embd, config.bias);
                    linear(&mut params, layer, BlockRole::ExpertProj(e), n_embd, inter, config.bias);
                }
            }
        }
    }

    params.push((LitParam::FinalNorm(ParamKind::Weight), vec![n_embd]));
    if norm_bias {
        params.push((LitParam::FinalNorm(ParamKind::Bias), vec![n_embd]));
    }
    params.push((LitParam::LmHead(ParamKind::Weight), vec![vocab, n_embd]));
    if config.lm_head_bias {
        params.push((LitParam::LmHead(ParamKind::Bias), vec![vocab]));
    }
    params
}

/// Check that a mapping holds exactly the parameters `config` implies.
pub fn validate_state_dict(config: &Config, state_dict: &StateDict) -> Result<()> {
    let expected: HashMap<LitParam, Vec<usize>> = expected_params(config).into_iter().collect();

    let mut names: Vec<&String> = state_dict.keys().collect();
    names.sort();
    for name in names {
        let param = parse_param(name)?;
        let Some(shape) = expected.get(&param) else {
            return Err(Error::UnexpectedParameter(format!(
                "{name} is not part of a {} model",
                describe(config)
            )));
        };
        let dims = state_dict[name].dims();
        if dims != shape.as_slice() {
            return Err(Error::ShapeMismatch(format!(
                "{name}: expected {shape:?}, found {dims:?}"
            )));
        }
    }

    let mut missing: Vec<String> = expected
        .keys()
        .map(LitParam::name)
        .filter(|name| !state_dict.contains_key(name))
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(Error::MissingParameter(format!(
            "{} parameter(s) absent, first: {}",
            missing.len(),
            missing[0]
        )));
    }
    Ok(())
}

fn describe(config: &Config) -> String {
    format!(
        "{} ({} layers, {:?} MLP, bias={})",
        config.display_name(),
        config.n_layer,
        config.mlp_class_name,
        config.bias
    )
}

/// Build a complete unified mapping for `config` whose values count upward
/// across all parameters, so every scalar in the mapping is distinct.
pub fn synthetic_state_dict(config: &Config, device: &Device) -> Result<StateDict> {
    let mut state_dict = StateDict::new();
    let mut offset = 0usize;
    for (param, shape) in expected_params(config) {
        let count: usize = shape.iter().product();
        let tensor = Tensor::arange(offset as u32, (offset + count) as u32, device)?
            .to_dtype(DType::F32)?
            .reshape(shape)?;
        offset += count;
        state_dict.insert(param.name(), tensor);
    }
    Ok(state_dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormClass;

    fn tiny_llama() -> Config {
        Config {
            name: "tiny-llama".to_string(),
            n_layer: 2,
            n_head: 4,
            n_embd: 8,
            n_query_groups: Some(2),
            padded_vocab_size: Some(16),
            bias: false,
            norm_class_name: NormClass::RmsNorm,
            mlp_class_name: MlpClass::Llama,
            intermediate_size: Some(12),
            ..Default::default()
        }
    }

    #[test]
    fn parse_and_render_are_inverse() {
        for name in [
            "transformer.wte.weight",
            "transformer.h.0.norm_1.weight",
            "transformer.h.11.attn.attn.bias",
            "transformer.h.3.attn.proj.weight",
            "transformer.h.2.mlp.fc_2.weight",
            "transformer.h.1.mlp.experts.7.proj.weight",
            "transformer.h.1.mlp.gate.weight",
            "transformer.ln_f.bias",
            "lm_head.bias",
        ] {
            let param = LitParam::parse(name).unwrap();
            assert_eq!(param.name(), name);
        }
    }

    #[test]
    fn parse_extracts_layer_and_expert() {
        assert_eq!(
            LitParam::parse("transformer.h.5.mlp.experts.3.fc_1.weight"),
            Some(LitParam::Block {
                layer: 5,
                role: BlockRole::ExpertFc1(3),
                kind: ParamKind::Weight,
            })
        );
    }

    #[test]
    fn parse_rejects_unknown_names() {
        for name in [
            "transformer.h.x.norm_1.weight",
            "transformer.h.0.attn.rope_cache",
            "transformer.h.0.mlp.experts.a.fc_1.weight",
            "transformer.h.0.norm_1.scale",
            "model.embed_tokens.weight",
        ] {
            assert_eq!(LitParam::parse(name), None, "{name}");
        }
        assert!(matches!(
            parse_param("encoder.weight"),
            Err(Error::UnexpectedParameter(_))
        ));
    }

    #[test]
    fn expected_params_cover_llama_block() {
        let config = tiny_llama();
        let params = expected_params(&config);
        // wte + 2 * (2 norms + qkv + proj + 3 mlp) + ln_f + lm_head
        assert_eq!(params.len(), 1 + 2 * 7 + 2);
        let qkv = params
            .iter()
            .find(|(p, _)| p.name() == "transformer.h.0.attn.attn.weight")
            .unwrap();
        assert_eq!(qkv.1, vec![(4 + 2 * 2) * 2, 8]);
    }

    #[test]
    fn expected_params_follow_bias_and_norm_flags() {
        let config = Config {
            n_layer: 1,
            n_head: 2,
            n_embd: 4,
            padded_vocab_size: Some(8),
            shared_attention_norm: true,
            lm_head_bias: true,
            ..Default::default()
        };
        let names: Vec<String> = expected_params(&config)
            .iter()
            .map(|(p, _)| p.name())
            .collect();
        assert!(names.contains(&"transformer.h.0.norm_1.bias".to_string()));
        assert!(!names.iter().any(|n| n.contains("norm_2")));
        assert!(names.contains(&"transformer.h.0.attn.attn.bias".to_string()));
        assert!(names.contains(&"lm_head.bias".to_string()));
    }

    #[test]
    fn synthetic_state_dict_validates() {
        let config = tiny_llama();
        let sd = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        validate_state_dict(&config, &sd).unwrap();
    }

    #[test]
    fn validate_reports_missing_parameter() {
        let config = tiny_llama();
        let mut sd = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        sd.remove("transformer.h.1.mlp.proj.weight");
        let err = validate_state_dict(&config, &sd).unwrap_err();
        match err {
            Error::MissingParameter(msg) => assert!(msg.contains("transformer.h.1.mlp.proj.weight")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_reports_leftover_parameter() {
        let config = tiny_llama();
        let mut sd = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let extra = sd["transformer.h.0.norm_1.weight"].clone();
        sd.insert("transformer.h.2.norm_1.weight".to_string(), extra);
        assert!(matches!(
            validate_state_dict(&config, &sd),
            Err(Error::UnexpectedParameter(_))
        ));
    }

    #[test]
    fn validate_reports_wrong_shape() {
        let config = tiny_llama();
        let mut sd = synthetic_state_dict(&config, &Device::Cpu).unwrap();
        let bad = Tensor::zeros((5, 8), DType::F32, &Device::Cpu).unwrap();
        sd.insert("transformer.h.0.attn.attn.weight".to_string(), bad);
        assert!(matches!(
            validate_state_dict(&config, &sd),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
