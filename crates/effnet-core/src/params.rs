//! Network-wide hyperparameters.

use crate::error::{Error, Result};
use crate::size::dimensions_from_size;
use crate::types::SizeSpec;
use serde::{Deserialize, Deserializer, Serialize};

/// Global parameters of an EfficientNet configuration.
///
/// Every field is optional: `None` means "use the architecture default",
/// which is distinct from an explicit zero. Records are never mutated;
/// [`GlobalParams::with_overrides`] returns a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalParams {
    pub width_coefficient: Option<f64>,
    pub depth_coefficient: Option<f64>,
    pub image_size: Option<SizeSpec>,
    pub dropout_rate: Option<f64>,
    pub num_classes: Option<usize>,
    pub batch_norm_momentum: Option<f64>,
    pub batch_norm_epsilon: Option<f64>,
    pub drop_connect_rate: Option<f64>,
    pub depth_divisor: Option<usize>,
    pub min_depth: Option<usize>,
    pub include_top: Option<bool>,
}

/// Field-level replacements for [`GlobalParams`].
///
/// Each field is a replacement: absent leaves the base value, `Some(None)`
/// clears it, `Some(Some(v))` sets it. In JSON a `null` clears a field; in
/// `key=value` form the value `none` does.
///
/// Unknown keys are rejected both when deserializing and when parsing
/// `key=value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalParamsOverrides {
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub width_coefficient: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub depth_coefficient: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub image_size: Option<Option<SizeSpec>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub dropout_rate: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<Option<usize>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub batch_norm_momentum: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub batch_norm_epsilon: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub drop_connect_rate: Option<Option<f64>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub depth_divisor: Option<Option<usize>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub min_depth: Option<Option<usize>>,
    #[serde(default, deserialize_with = "replacement", skip_serializing_if = "Option::is_none")]
    pub include_top: Option<Option<bool>>,
}

/// Keep an explicit `null` apart from a missing field.
fn replacement<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Value of a field after a replacement
fn replaced<T: Clone>(replacement: &Option<Option<T>>, base: &Option<T>) -> Option<T> {
    match replacement {
        Some(value) => value.clone(),
        None => base.clone(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::InvalidArgument(format!("invalid value '{}' for override '{}'", value, key))
    })
}

fn parse_optional<T>(key: &str, value: &str, parse: fn(&str, &str) -> Result<T>) -> Result<Option<T>> {
    if value.trim().eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse(key, value).map(Some)
    }
}

fn parse_size(key: &str, value: &str) -> Result<SizeSpec> {
    let parts: Vec<&str> = value.split(['x', ',']).collect();
    if parts.len() == 1 {
        return parse_value(key, parts[0]).map(SizeSpec::Scalar);
    }
    parts
        .iter()
        .map(|p| parse_value(key, p))
        .collect::<Result<Vec<usize>>>()
        .map(SizeSpec::Seq)
}

impl GlobalParamsOverrides {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Set a single field from its textual form; `none` clears it.
    ///
    /// Image sizes accept `224`, `240x320` or `240,320`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "width_coefficient" => self.width_coefficient = Some(parse_optional(key, value, parse_value)?),
            "depth_coefficient" => self.depth_coefficient = Some(parse_optional(key, value, parse_value)?),
            "image_size" => self.image_size = Some(parse_optional(key, value, parse_size)?),
            "dropout_rate" => self.dropout_rate = Some(parse_optional(key, value, parse_value)?),
            "num_classes" => self.num_classes = Some(parse_optional(key, value, parse_value)?),
            "batch_norm_momentum" => self.batch_norm_momentum = Some(parse_optional(key, value, parse_value)?),
            "batch_norm_epsilon" => self.batch_norm_epsilon = Some(parse_optional(key, value, parse_value)?),
            "drop_connect_rate" => self.drop_connect_rate = Some(parse_optional(key, value, parse_value)?),
            "depth_divisor" => self.depth_divisor = Some(parse_optional(key, value, parse_value)?),
            "min_depth" => self.min_depth = Some(parse_optional(key, value, parse_value)?),
            "include_top" => self.include_top = Some(parse_optional(key, value, parse_value)?),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is not a global parameter",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Parse `key=value` pairs, later pairs replacing earlier ones.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self> {
        let mut overrides = Self::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("override '{}' must look like key=value", pair))
            })?;
            overrides.set(key.trim(), value)?;
        }
        Ok(overrides)
    }

    /// Layer `other` on top of `self`: fields present in `other` win.
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            width_coefficient: other.width_coefficient.or(self.width_coefficient),
            depth_coefficient: other.depth_coefficient.or(self.depth_coefficient),
            image_size: other.image_size.clone().or_else(|| self.image_size.clone()),
            dropout_rate: other.dropout_rate.or(self.dropout_rate),
            num_classes: other.num_classes.or(self.num_classes),
            batch_norm_momentum: other.batch_norm_momentum.or(self.batch_norm_momentum),
            batch_norm_epsilon: other.batch_norm_epsilon.or(self.batch_norm_epsilon),
            drop_connect_rate: other.drop_connect_rate.or(self.drop_connect_rate),
            depth_divisor: other.depth_divisor.or(self.depth_divisor),
            min_depth: other.min_depth.or(self.min_depth),
            include_top: other.include_top.or(self.include_top),
        }
    }
}

impl GlobalParams {
    /// New record with every field present in `overrides` replaced.
    pub fn with_overrides(&self, overrides: &GlobalParamsOverrides) -> Self {
        Self {
            width_coefficient: replaced(&overrides.width_coefficient, &self.width_coefficient),
            depth_coefficient: replaced(&overrides.depth_coefficient, &self.depth_coefficient),
            image_size: replaced(&overrides.image_size, &self.image_size),
            dropout_rate: replaced(&overrides.dropout_rate, &self.dropout_rate),
            num_classes: replaced(&overrides.num_classes, &self.num_classes),
            batch_norm_momentum: replaced(&overrides.batch_norm_momentum, &self.batch_norm_momentum),
            batch_norm_epsilon: replaced(&overrides.batch_norm_epsilon, &self.batch_norm_epsilon),
            drop_connect_rate: replaced(&overrides.drop_connect_rate, &self.drop_connect_rate),
            depth_divisor: replaced(&overrides.depth_divisor, &self.depth_divisor),
            min_depth: replaced(&overrides.min_depth, &self.min_depth),
            include_top: replaced(&overrides.include_top, &self.include_top),
        }
    }

    /// Check value ranges of the fields that are set.
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("dropout_rate", self.dropout_rate),
            ("drop_connect_rate", self.drop_connect_rate),
        ] {
            if let Some(rate) = rate {
                if !(0.0..1.0).contains(&rate) {
                    return Err(Error::InvalidArgument(format!(
                        "{} must be in range [0.0, 1.0), got {}",
                        name, rate
                    )));
                }
            }
        }
        if let Some(size) = &self.image_size {
            let (height, width) = dimensions_from_size(size)?;
            if height == 0 || width == 0 {
                return Err(Error::InvalidArgument(format!("image_size must be positive, got {}", size)));
            }
        }
        if self.depth_divisor == Some(0) {
            return Err(Error::InvalidArgument("depth_divisor must be positive".to_string()));
        }
        if self.num_classes == Some(0) {
            return Err(Error::InvalidArgument("num_classes must be positive".to_string()));
        }
        for (name, coefficient) in [
            ("width_coefficient", self.width_coefficient),
            ("depth_coefficient", self.depth_coefficient),
        ] {
            if coefficient.is_some_and(|c| c < 0.0 || !c.is_finite()) {
                return Err(Error::InvalidArgument(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_overrides_replaces_only_set_fields() {
        let base = GlobalParams {
            width_coefficient: Some(1.0),
            num_classes: Some(1000),
            include_top: Some(true),
            ..Default::default()
        };
        let overrides = GlobalParamsOverrides {
            num_classes: Some(Some(10)),
            include_top: Some(Some(false)),
            ..Default::default()
        };

        let updated = base.with_overrides(&overrides);
        assert_eq!(updated.num_classes, Some(10));
        assert_eq!(updated.include_top, Some(false));
        assert_eq!(updated.width_coefficient, Some(1.0));
        // the original is untouched
        assert_eq!(base.num_classes, Some(1000));
    }

    #[test]
    fn test_from_pairs() {
        let overrides =
            GlobalParamsOverrides::from_pairs(&["num_classes=7", "image_size=240x320", "include_top=false"])
                .unwrap();
        assert_eq!(overrides.num_classes, Some(Some(7)));
        assert_eq!(overrides.image_size, Some(Some(SizeSpec::hw(240, 320))));
        assert_eq!(overrides.include_top, Some(Some(false)));
        assert!(!overrides.is_empty());
    }

    #[test]
    fn test_clear_field_with_none() {
        let overrides = GlobalParamsOverrides::from_pairs(&["image_size=none", "min_depth=None"]).unwrap();
        assert_eq!(overrides.image_size, Some(None));
        assert_eq!(overrides.min_depth, Some(None));

        let base = GlobalParams {
            image_size: Some(SizeSpec::Scalar(224)),
            min_depth: Some(8),
            num_classes: Some(1000),
            ..Default::default()
        };
        let updated = base.with_overrides(&overrides);
        assert_eq!(updated.image_size, None);
        assert_eq!(updated.min_depth, None);
        assert_eq!(updated.num_classes, Some(1000));
    }

    #[test]
    fn test_deserialize_null_clears_field() {
        let parsed: GlobalParamsOverrides = serde_json::from_str(r#"{"image_size": null}"#).unwrap();
        assert_eq!(parsed.image_size, Some(None));
        assert!(!parsed.is_empty());

        let base = GlobalParams {
            image_size: Some(SizeSpec::Scalar(112)),
            ..Default::default()
        };
        assert_eq!(base.with_overrides(&parsed).image_size, None);
    }

    #[test]
    fn test_from_pairs_rejects_unknown_key() {
        let err = GlobalParamsOverrides::from_pairs(&["learning_rate=0.1"]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_from_pairs_rejects_bad_value_and_shape() {
        assert!(GlobalParamsOverrides::from_pairs(&["num_classes=ten"]).is_err());
        assert!(GlobalParamsOverrides::from_pairs(&["num_classes"]).is_err());
    }

    #[test]
    fn test_deserialize_rejects_unknown_key() {
        let parsed: std::result::Result<GlobalParamsOverrides, _> =
            serde_json::from_str(r#"{"num_classes": 3, "momentum": 0.9}"#);
        assert!(parsed.is_err());

        let parsed: GlobalParamsOverrides =
            serde_json::from_str(r#"{"num_classes": 3, "image_size": [64, 48]}"#).unwrap();
        assert_eq!(parsed.num_classes, Some(Some(3)));
        assert_eq!(parsed.image_size, Some(Some(SizeSpec::hw(64, 48))));
        assert_eq!(parsed.dropout_rate, None);
    }

    #[test]
    fn test_merged_prefers_later_layer() {
        let file = GlobalParamsOverrides {
            num_classes: Some(Some(5)),
            dropout_rate: Some(Some(0.3)),
            ..Default::default()
        };
        let cli = GlobalParamsOverrides {
            num_classes: Some(Some(9)),
            dropout_rate: Some(None),
            ..Default::default()
        };
        let merged = file.merged(&cli);
        assert_eq!(merged.num_classes, Some(Some(9)));
        // a later clear beats an earlier value
        assert_eq!(merged.dropout_rate, Some(None));
    }

    #[test]
    fn test_validate() {
        assert!(GlobalParams::default().validate().is_ok());

        let bad = GlobalParams {
            dropout_rate: Some(1.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = GlobalParams {
            image_size: Some(SizeSpec::Seq(vec![1, 2, 3])),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));

        let bad = GlobalParams {
            image_size: Some(SizeSpec::hw(0, 32)),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = GlobalParams {
            depth_divisor: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
