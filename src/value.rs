//! Sample values and thresholds.
//!
//! Metric sources report one of a small closed set of value shapes. Each metric
//! declares its [`ValueKind`] once, and the [`Comparator`] used to test its
//! threshold watches is chosen from that kind when the metric node is built.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A sampled metric value.
///
/// # Examples
///
/// ```
/// use metron::{MetricValue, ValueKind};
///
/// let level = MetricValue::Int(42);
/// assert_eq!(level.kind(), ValueKind::Int);
/// assert_eq!(level.as_f64(), Some(42.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Location(GeoPoint),
}

impl MetricValue {
    /// The shape of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Location(_) => ValueKind::Location,
        }
    }

    /// Numeric view of integer and float values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Location(_) => None,
        }
    }

    #[must_use]
    pub const fn as_location(&self) -> Option<GeoPoint> {
        match self {
            Self::Location(p) => Some(*p),
            _ => None,
        }
    }
}

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle (haversine) distance in meters.
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// Value shape declared by a metric source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Location,
}

/// The bound a threshold watch compares samples against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Threshold {
    Int { value: i64 },
    Float { value: f64 },
    /// Distance in meters from a fixed origin.
    DistanceFrom { origin: GeoPoint, meters: f64 },
}

impl Threshold {
    /// Scalar used to keep threshold lists in ascending order.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sort_key(&self) -> f64 {
        match self {
            Self::Int { value } => *value as f64,
            Self::Float { value } => *value,
            Self::DistanceFrom { meters, .. } => *meters,
        }
    }

    /// Rejects thresholds that can never be compared meaningfully.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidThreshold` for non-finite bounds, negative
    /// distances or out-of-range coordinates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Int { .. } => Ok(()),
            Self::Float { value } if value.is_finite() => Ok(()),
            Self::Float { value } => Err(ValidationError::InvalidThreshold {
                reason: format!("float threshold must be finite, got {value}"),
            }),
            Self::DistanceFrom { origin, meters } => {
                if !meters.is_finite() || *meters < 0.0 {
                    return Err(ValidationError::InvalidThreshold {
                        reason: format!("distance must be a finite non-negative number, got {meters}"),
                    });
                }
                if !(-90.0..=90.0).contains(&origin.latitude)
                    || !(-180.0..=180.0).contains(&origin.longitude)
                {
                    return Err(ValidationError::InvalidThreshold {
                        reason: format!("origin out of range: {origin:?}"),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Orders a sample against a threshold; `None` when the two cannot be compared.
pub type Comparator = fn(&MetricValue, &Threshold) -> Option<Ordering>;

/// Picks the comparator for a metric's declared value kind.
#[must_use]
pub fn comparator_for(kind: ValueKind) -> Comparator {
    match kind {
        ValueKind::Int => compare_int,
        ValueKind::Float => compare_float,
        ValueKind::Location => compare_location,
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare_int(sample: &MetricValue, threshold: &Threshold) -> Option<Ordering> {
    let MetricValue::Int(v) = sample else {
        return None;
    };
    match threshold {
        Threshold::Int { value } => Some(v.cmp(value)),
        Threshold::Float { value } => (*v as f64).partial_cmp(value),
        Threshold::DistanceFrom { .. } => None,
    }
}

fn compare_float(sample: &MetricValue, threshold: &Threshold) -> Option<Ordering> {
    let v = match sample {
        MetricValue::Int(_) | MetricValue::Float(_) => sample.as_f64()?,
        MetricValue::Location(_) => return None,
    };
    match threshold {
        Threshold::Int { .. } | Threshold::Float { .. } => v.partial_cmp(&threshold.sort_key()),
        Threshold::DistanceFrom { .. } => None,
    }
}

fn compare_location(sample: &MetricValue, threshold: &Threshold) -> Option<Ordering> {
    let (MetricValue::Location(here), Threshold::DistanceFrom { origin, meters }) = (sample, threshold) else {
        return None;
    };
    here.distance_m(origin).partial_cmp(meters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_comparator_orders_numeric_thresholds() {
        let cmp = comparator_for(ValueKind::Int);
        assert_eq!(cmp(&MetricValue::Int(5), &Threshold::Int { value: 5 }), Some(Ordering::Equal));
        assert_eq!(cmp(&MetricValue::Int(5), &Threshold::Float { value: 5.5 }), Some(Ordering::Less));
        assert_eq!(cmp(&MetricValue::Float(5.0), &Threshold::Int { value: 5 }), None);
    }

    #[test]
    fn float_comparator_accepts_int_samples() {
        let cmp = comparator_for(ValueKind::Float);
        assert_eq!(cmp(&MetricValue::Int(3), &Threshold::Float { value: 2.5 }), Some(Ordering::Greater));
        assert_eq!(cmp(&MetricValue::Float(f64::NAN), &Threshold::Float { value: 2.5 }), None);
    }

    #[test]
    fn location_comparator_uses_distance_from_origin() {
        let cmp = comparator_for(ValueKind::Location);
        let origin = GeoPoint::new(52.52, 13.405);
        let near = MetricValue::Location(GeoPoint::new(52.5201, 13.405));
        let far = MetricValue::Location(GeoPoint::new(48.8566, 2.3522));
        let fence = Threshold::DistanceFrom { origin, meters: 1_000.0 };

        assert_eq!(cmp(&near, &fence), Some(Ordering::Less));
        assert_eq!(cmp(&far, &fence), Some(Ordering::Greater));
        assert_eq!(cmp(&near, &Threshold::Int { value: 3 }), None);
    }

    #[test]
    fn haversine_distance_is_plausible() {
        let berlin = GeoPoint::new(52.52, 13.405);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = berlin.distance_m(&paris);
        assert!((870_000.0..890_000.0).contains(&d), "got {d}");
        assert!(berlin.distance_m(&berlin).abs() < 1e-6);
    }

    #[test]
    fn threshold_validation_rejects_non_finite_and_negative() {
        assert!(Threshold::Float { value: f64::INFINITY }.validate().is_err());
        assert!(Threshold::DistanceFrom {
            origin: GeoPoint::new(0.0, 0.0),
            meters: -1.0
        }
        .validate()
        .is_err());
        assert!(Threshold::DistanceFrom {
            origin: GeoPoint::new(91.0, 0.0),
            meters: 1.0
        }
        .validate()
        .is_err());
        assert!(Threshold::Int { value: -7 }.validate().is_ok());
    }

    #[test]
    fn value_serializes_tagged() {
        let json = serde_json::to_value(MetricValue::Float(1.5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "float", "value": 1.5}));
    }
}
