//! Client-supplied boolean expressions over thresholds.
//!
//! Expressions are plain serializable data. They are validated here and turned
//! into a [`ConditionTree`](super::ConditionTree) when registered.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::metric::MetricId;
use crate::time::Millis;
use crate::value::Threshold;

/// Deepest nesting accepted from a client.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

/// Boolean expression over metric thresholds.
///
/// # Examples
///
/// ```
/// use metron::{Expression, Threshold};
///
/// // battery <= 15 AND light >= 300
/// let expr = Expression::below("battery", Threshold::Int { value: 15 })
///     .and(Expression::above("light", Threshold::Float { value: 300.0 }));
/// assert_eq!(expr.leaf_count(), 2);
///
/// let json = serde_json::to_string(&expr).unwrap();
/// assert_eq!(Expression::from_json(&json).unwrap(), expr);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    /// True while the metric is at/above (`is_max`) or at/below the threshold;
    /// inverted when `negated`.
    Threshold {
        metric: MetricId,
        threshold: Threshold,
        is_max: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        period_ms: Option<Millis>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        negated: bool,
    },

    And {
        left: Box<Expression>,
        right: Box<Expression>,
    },

    Or {
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Leaf that holds while `metric >= threshold`.
    #[must_use]
    pub fn above(metric: impl Into<MetricId>, threshold: Threshold) -> Self {
        Self::Threshold {
            metric: metric.into(),
            threshold,
            is_max: true,
            period_ms: None,
            negated: false,
        }
    }

    /// Leaf that holds while `metric <= threshold`.
    #[must_use]
    pub fn below(metric: impl Into<MetricId>, threshold: Threshold) -> Self {
        Self::Threshold {
            metric: metric.into(),
            threshold,
            is_max: false,
            period_ms: None,
            negated: false,
        }
    }

    /// Sets the re-check period of a leaf. No effect on AND/OR.
    #[must_use]
    pub fn every(mut self, period: Millis) -> Self {
        if let Self::Threshold { period_ms, .. } = &mut self {
            *period_ms = Some(period);
        }
        self
    }

    /// Turns a leaf into its anti-condition. No effect on AND/OR.
    #[must_use]
    pub fn negate(mut self) -> Self {
        if let Self::Threshold { negated, .. } = &mut self {
            *negated = !*negated;
        }
        self
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// Parses and validates an expression from JSON.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidExpression` for malformed JSON and any
    /// error from [`Expression::validate`].
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let expr: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidExpression {
            reason: format!("invalid expression json: {e}"),
        })?;
        expr.validate()?;
        Ok(expr)
    }

    /// Checks thresholds, periods and nesting depth.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, depth first.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), ValidationError> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(ValidationError::InvalidExpression {
                reason: format!("expression nested deeper than {MAX_EXPRESSION_DEPTH}"),
            });
        }
        match self {
            Self::Threshold {
                metric,
                threshold,
                period_ms,
                ..
            } => {
                if metric.as_str().is_empty() {
                    return Err(ValidationError::InvalidExpression {
                        reason: "threshold leaf has an empty metric".to_string(),
                    });
                }
                if let Some(p) = period_ms {
                    if *p <= 0 {
                        return Err(ValidationError::InvalidPeriod { period_ms: *p });
                    }
                }
                threshold.validate()
            }
            Self::And { left, right } | Self::Or { left, right } => {
                left.validate_at(depth + 1)?;
                right.validate_at(depth + 1)
            }
        }
    }

    /// Number of threshold leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Threshold { .. } => 1,
            Self::And { left, right } | Self::Or { left, right } => left.leaf_count() + right.leaf_count(),
        }
    }
}
