//! Score representations produced by simulation instances.
//!
//! A terminal simulation reports one of two score shapes. The raw payload is
//! resolved into a [`ScoreRecord`] once, at ingestion, and never re-inspected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ScoreError;

/// Keys accepted as the single value of a scalar score object, in priority order.
const SCALAR_KEYS: &[&str] = &["score", "final_score", "final_balance", "value"];

/// One named dimension of a composite score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionScore {
    /// Dimension score, 0–100.
    pub score: f64,
    /// Declared weight, when the simulation reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// Terminal evaluation of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ScoreRecord {
    /// A single ordinal value (e.g. final balance).
    Scalar { value: f64 },

    /// A precomputed weighted composite plus its breakdown.
    Composite {
        /// The value used for ranking. Never re-derived from `dimensions`.
        composite: f64,
        dimensions: BTreeMap<String, DimensionScore>,
        /// Behavioural signals kept for reporting only.
        #[serde(default)]
        hidden_metrics: BTreeMap<String, Value>,
    },
}

/// Which comparable family a leaderboard value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreScheme {
    Composite,
    Scalar,
    /// No score payload was received; ranked on the last primary metric.
    Unscored,
}

impl ScoreScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreScheme::Composite => "composite",
            ScoreScheme::Scalar => "scalar",
            ScoreScheme::Unscored => "unscored",
        }
    }
}

impl std::fmt::Display for ScoreScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl ScoreRecord {
    /// The scheme this record ranks under.
    pub fn scheme(&self) -> ScoreScheme {
        match self {
            ScoreRecord::Scalar { .. } => ScoreScheme::Scalar,
            ScoreRecord::Composite { .. } => ScoreScheme::Composite,
        }
    }

    /// The value this record ranks by.
    pub fn rank_value(&self) -> f64 {
        match self {
            ScoreRecord::Scalar { value } => *value,
            ScoreRecord::Composite { composite, .. } => *composite,
        }
    }

    /// Resolve a raw simulation payload into a score record.
    ///
    /// Accepted shapes:
    /// - a bare number → scalar
    /// - `{"composite_score": n, "dimension_scores": {...}, "weights": {...},
    ///   "hidden_metrics": {...}}` → composite (`composite` and `dimensions`
    ///   are accepted as aliases; a dimension may be a number or
    ///   `{"score": n, "weight": w}`)
    /// - `{"score" | "final_score" | "final_balance" | "value": n}` → scalar
    pub fn from_payload(payload: &Value) -> Result<Self, ScoreError> {
        match payload {
            Value::Number(_) => Ok(ScoreRecord::Scalar {
                value: finite(payload, "score")?,
            }),
            Value::Object(map) => {
                let composite = map.get("composite_score").or_else(|| map.get("composite"));
                if let Some(composite) = composite {
                    return composite_from(map, composite);
                }
                for key in SCALAR_KEYS {
                    if let Some(v) = map.get(*key) {
                        return Ok(ScoreRecord::Scalar {
                            value: finite(v, key)?,
                        });
                    }
                }
                Err(unrecognised(payload))
            }
            _ => Err(unrecognised(payload)),
        }
    }
}

fn composite_from(map: &Map<String, Value>, composite: &Value) -> Result<ScoreRecord, ScoreError> {
    let composite = finite(composite, "composite_score")?;
    let weights = map.get("weights").and_then(Value::as_object);

    let mut dimensions = BTreeMap::new();
    let raw_dims = map
        .get("dimension_scores")
        .or_else(|| map.get("dimensions"))
        .and_then(Value::as_object);
    for (name, raw) in raw_dims.into_iter().flatten() {
        let (score, inline_weight) = match raw {
            Value::Object(obj) => {
                let score = obj
                    .get("score")
                    .ok_or_else(|| ScoreError::NotANumber {
                        field: format!("dimension_scores.{name}"),
                    })
                    .and_then(|v| finite(v, &format!("dimension_scores.{name}")))?;
                let weight = obj
                    .get("weight")
                    .map(|w| finite(w, &format!("dimension_scores.{name}.weight")))
                    .transpose()?;
                (score, weight)
            }
            other => (finite(other, &format!("dimension_scores.{name}"))?, None),
        };
        if !(0.0..=100.0).contains(&score) {
            return Err(ScoreError::DimensionOutOfRange {
                dimension: name.clone(),
                score,
            });
        }
        let weight = match inline_weight {
            Some(w) => Some(w),
            None => weights
                .and_then(|w| w.get(name))
                .map(|w| finite(w, &format!("weights.{name}")))
                .transpose()?,
        };
        dimensions.insert(name.clone(), DimensionScore { score, weight });
    }

    let hidden_metrics = map
        .get("hidden_metrics")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Ok(ScoreRecord::Composite {
        composite,
        dimensions,
        hidden_metrics,
    })
}

fn finite(v: &Value, field: &str) -> Result<f64, ScoreError> {
    v.as_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| ScoreError::NotANumber {
            field: field.to_string(),
        })
}

fn unrecognised(payload: &Value) -> ScoreError {
    let mut text = payload.to_string();
    if text.len() > 200 {
        let cut = (0..=200).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        text.truncate(cut);
        text.push('…');
    }
    ScoreError::UnrecognisedShape { payload: text }
}
