//! CLI flag value constraints.
//!
//! Manifests declare constraints as `{kind, validationSet?, range?}`. The
//! payload fields stay optional in the serialized shape so that a manifest
//! with an unrecognized kind still loads; the mismatch surfaces when the
//! constraint is rendered or used, through [`Constraints::resolve`].

use crate::ConstraintError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const VALIDATION_SET_KIND: &str = "validation-set";
pub const RANGE_KIND: &str = "range";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub kind: String,
    #[serde(
        rename = "validationSet",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub validation_set: Option<ValidationSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// Typed view of a [`Constraints`] block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint<'a> {
    ValidationSet(&'a ValidationSet),
    Range(&'a Range),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationSet(pub Vec<String>);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Constraints {
    pub fn validation_set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: VALIDATION_SET_KIND.to_owned(),
            validation_set: Some(ValidationSet(values.into_iter().map(Into::into).collect())),
            range: None,
        }
    }

    pub fn range(min: f64, max: f64) -> Self {
        Self {
            kind: RANGE_KIND.to_owned(),
            validation_set: None,
            range: Some(Range { min, max }),
        }
    }

    /// Dispatch on `kind` to the matching payload.
    pub fn resolve(&self) -> Result<Constraint<'_>, ConstraintError> {
        match self.kind.as_str() {
            VALIDATION_SET_KIND => self
                .validation_set
                .as_ref()
                .map(Constraint::ValidationSet)
                .ok_or(ConstraintError::MissingValidationSet),
            RANGE_KIND => self
                .range
                .as_ref()
                .map(Constraint::Range)
                .ok_or(ConstraintError::MissingRange),
            other => Err(ConstraintError::UnknownKind(other.to_owned())),
        }
    }

    pub fn validate(&self, value: impl fmt::Display) -> Result<(), ConstraintError> {
        match self.resolve()? {
            Constraint::ValidationSet(set) => set.validate(value),
            Constraint::Range(range) => range.validate(value),
        }
    }

    /// Human-readable form: `[a|b|c]` or `[min,max]`.
    pub fn render(&self) -> Result<String, ConstraintError> {
        Ok(match self.resolve()? {
            Constraint::ValidationSet(set) => set.to_string(),
            Constraint::Range(range) => range.to_string(),
        })
    }
}

impl ValidationSet {
    /// The value is stringified and must be an exact member of the set.
    pub fn validate(&self, value: impl fmt::Display) -> Result<(), ConstraintError> {
        let value = value.to_string();
        if self.0.contains(&value) {
            Ok(())
        } else {
            Err(ConstraintError::InvalidValue {
                value,
                valid: self.to_string(),
            })
        }
    }
}

impl fmt::Display for ValidationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join("|"))
    }
}

impl Range {
    /// The value is parsed as a float and must lie within `[min, max]`.
    pub fn validate(&self, value: impl fmt::Display) -> Result<(), ConstraintError> {
        let value = value.to_string();
        let number: f64 = match value.parse() {
            Ok(n) if !f64::is_nan(n) => n,
            _ => return Err(ConstraintError::NotANumber(value)),
        };
        if number < self.min || number > self.max {
            return Err(ConstraintError::OutOfRange {
                value,
                range: self.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min, self.max)
    }
}
