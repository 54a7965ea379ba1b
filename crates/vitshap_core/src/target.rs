//! Interpretation of surrogate logits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// How the target model's logits are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    /// One sigmoid output per sample.
    Binary,
    /// Mutually exclusive classes, softmax over the output dimension.
    MultiClass,
    /// Independent sigmoid per output.
    MultiLabel,
}

impl TargetType {
    /// The configuration string for this target type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TargetType::Binary => "binary",
            TargetType::MultiClass => "multi-class",
            TargetType::MultiLabel => "multi-label",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(TargetType::Binary),
            "multi-class" => Ok(TargetType::MultiClass),
            "multi-label" => Ok(TargetType::MultiLabel),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown target type '{}', expected binary, multi-class or multi-label",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_type_roundtrip_strings() {
        for t in [TargetType::Binary, TargetType::MultiClass, TargetType::MultiLabel] {
            assert_eq!(t.as_str().parse::<TargetType>().unwrap(), t);
        }
        assert!("regression".parse::<TargetType>().is_err());
    }
}
