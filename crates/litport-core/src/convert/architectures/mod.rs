//! Per-family mappers from unified names to target names.
//!
//! Each mapper is a pure function of `(config, mapping)`. Tensors that need no
//! re-packing are shared with the source rather than copied.

pub mod falcon;
pub mod gpt_neox;
pub mod llama;
pub mod phi;

use candle_core::Tensor;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::weights::StateDict;

use super::names::{parse_param, LitParam};

/// Error for a unified parameter the target family has no slot for.
pub(crate) fn no_counterpart(family: &str, param: &LitParam) -> Error {
    Error::UnexpectedParameter(format!("{} has no {family} counterpart", param.name()))
}

/// Parse every source name up front so mappers can match on roles.
pub(crate) fn parsed_params(source: &StateDict) -> Result<Vec<(LitParam, &Tensor)>> {
    let mut params = source
        .iter()
        .map(|(name, tensor)| Ok((parse_param(name)?, tensor)))
        .collect::<Result<Vec<_>>>()?;
    params.sort_by_key(|(param, _)| *param);
    Ok(params)
}

pub(crate) fn insert(target: &mut StateDict, name: String, tensor: Tensor) -> Result<()> {
    if target.contains_key(&name) {
        return Err(Error::InvalidInput(format!(
            "two source parameters map onto {name}"
        )));
    }
    target.insert(name, tensor);
    Ok(())
}

/// Families that fuse attention as one head-major block reject shared keys.
pub(crate) fn require_multi_head(family: &str, config: &Config) -> Result<()> {
    if config.n_query_groups() != config.n_head {
        return Err(Error::UnsupportedFamily(format!(
            "{family} checkpoints need one key/value head per query head, {} has n_head={} and n_query_groups={}",
            config.display_name(),
            config.n_head,
            config.n_query_groups()
        )));
    }
    Ok(())
}

/// Families with an ungated `fc -> proj` MLP.
pub(crate) fn require_ungated_mlp(family: &str, config: &Config) -> Result<()> {
    if config.mlp_class_name.is_gated() {
        return Err(Error::UnsupportedFamily(format!(
            "{family} checkpoints have no slot for the {:?} MLP of {}",
            config.mlp_class_name,
            config.display_name()
        )));
    }
    Ok(())
}
