//! Vectorizer configuration (stage toggles).

use serde::{Deserialize, Serialize};

/// Switches for the individual stages of the vectorizer, mostly useful for
/// diagnosing miscompiles (and bisecting regressions) by disabling stages.
///
/// A disabled stage leaves the function exactly as if it didn't exist.
///
/// Can be deserialized from JSON, with any missing field taking its default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VectorizerConfig {
    /// Array-of-structs to struct-of-vectors layout optimization (external
    /// stage, runs if registered). Default: `true`.
    pub struct_opt: bool,

    /// Scalar replication of varying aggregates (external stage, runs if
    /// registered). Default: `true`.
    pub srov: bool,

    /// IR polishing after code generation (external stage, runs if
    /// registered). Default: `true`.
    pub ir_polish: bool,

    /// Reduction-chain optimization. Default: `true`.
    pub reduction_opt: bool,

    /// The control-flow pipeline itself (divergent-loop normalization,
    /// mask expansion and linearization). Default: `true`.
    pub control_flow: bool,

    /// Execute masked calls to non-intrinsic functions one active lane at a
    /// time, through a cascade of per-lane blocks. Default: `false`.
    pub cascade_calls: bool,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            struct_opt: true,
            srov: true,
            ir_polish: true,
            reduction_opt: true,
            control_flow: true,
            cascade_calls: false,
        }
    }
}

impl VectorizerConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = VectorizerConfig::from_json(r#"{ "srov": false, "cascade_calls": true }"#)
            .unwrap();
        assert_eq!(
            config,
            VectorizerConfig { srov: false, cascade_calls: true, ..VectorizerConfig::default() }
        );
        assert_eq!(VectorizerConfig::from_json("{}").unwrap(), VectorizerConfig::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(VectorizerConfig::from_json(r#"{ "polish": false }"#).is_err());
    }
}
