//! Search space model: parameter domains, constraints and the encoded
//! (unit-cube) view strategies sample in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::errors::{SpaceError, TuneResult};

/// A concrete parameter value.
///
/// Untagged so that trial logs stay readable; variant order matters: an
/// integer literal must never decode as a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    /// Numeric view, for integer and continuous parameters.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// A full parameter assignment, ordered by name so that serialization is
/// deterministic.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Describes the domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Finite set of unique choices.
    Categorical { choices: Vec<ParameterValue> },
    /// Integer range [low, high] inclusive.
    Integer { low: i64, high: i64 },
    /// Continuous range [low, high], sampled uniformly.
    Continuous { low: f64, high: f64 },
    /// Continuous range [low, high], sampled uniformly in log-space.
    LogContinuous { low: f64, high: f64 },
}

/// A single tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
    /// Explicit default; when absent a domain-derived default is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Check the domain itself: bounds ordered and finite, choices unique,
    /// default inside the domain.
    pub fn check(&self) -> Result<(), SpaceError> {
        let invalid = |message: &str| SpaceError::InvalidSpec {
            parameter: self.name.clone(),
            message: message.to_string(),
        };

        match &self.kind {
            ParameterKind::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("categorical domain is empty"));
                }
                for (i, choice) in choices.iter().enumerate() {
                    if matches!(choice, ParameterValue::Float(v) if !v.is_finite()) {
                        return Err(invalid("categorical choices must be finite"));
                    }
                    if choices[..i].contains(choice) {
                        return Err(invalid(&format!("duplicate choice {choice}")));
                    }
                }
            }
            ParameterKind::Integer { low, high } => {
                if low >= high {
                    return Err(invalid("lower bound must be below upper bound"));
                }
            }
            ParameterKind::Continuous { low, high } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return Err(invalid("bounds must be finite with low < high"));
                }
            }
            ParameterKind::LogContinuous { low, high } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return Err(invalid("bounds must be finite with low < high"));
                }
                if *low <= 0.0 {
                    return Err(invalid("log-scale bounds must be positive"));
                }
            }
        }

        if let Some(default) = &self.default {
            self.contains(default)?;
        }
        Ok(())
    }

    /// Domain membership of a single value.
    pub fn contains(&self, value: &ParameterValue) -> Result<(), SpaceError> {
        let violation = |message: String| SpaceError::DomainViolation {
            parameter: self.name.clone(),
            message,
        };

        match (&self.kind, value) {
            (ParameterKind::Categorical { choices }, v) => {
                if choices.contains(v) {
                    Ok(())
                } else {
                    Err(violation(format!("{v} is not one of the declared choices")))
                }
            }
            (ParameterKind::Integer { low, high }, ParameterValue::Int(v)) => {
                if v < low || v > high {
                    Err(violation(format!("{v} outside [{low}, {high}]")))
                } else {
                    Ok(())
                }
            }
            (
                ParameterKind::Continuous { low, high } | ParameterKind::LogContinuous { low, high },
                ParameterValue::Float(v),
            ) => {
                if !v.is_finite() || v < low || v > high {
                    Err(violation(format!("{v} outside [{low}, {high}]")))
                } else {
                    Ok(())
                }
            }
            (_, v) => Err(violation(format!("{v} has the wrong type"))),
        }
    }

    /// The explicit default, or the domain midpoint (geometric midpoint for
    /// log-scale parameters, first choice for categoricals).
    pub fn default_value(&self) -> ParameterValue {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match &self.kind {
            ParameterKind::Categorical { choices } => choices[0].clone(),
            ParameterKind::Integer { low, high } => {
                ParameterValue::Int((*low as i128 + integer_span(*low, *high) / 2) as i64)
            }
            ParameterKind::Continuous { low, high } => ParameterValue::Float(low + (high - low) / 2.0),
            ParameterKind::LogContinuous { low, high } => {
                ParameterValue::Float((low * high).sqrt().clamp(*low, *high))
            }
        }
    }

    /// Number of distinct values, `None` for continuous domains.
    pub fn cardinality(&self) -> Option<usize> {
        match &self.kind {
            ParameterKind::Categorical { choices } => Some(choices.len()),
            ParameterKind::Integer { low, high } => usize::try_from(integer_span(*low, *high))
                .ok()
                .and_then(|d| d.checked_add(1)),
            _ => None,
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, ParameterKind::Categorical { .. })
    }

    /// Map a value into the unit interval. Log-scale parameters are encoded in
    /// log-space, integers and categoricals at their bucket centres.
    pub fn encode(&self, value: &ParameterValue) -> Option<f64> {
        let encoded = match &self.kind {
            ParameterKind::Categorical { choices } => {
                let idx = choices.iter().position(|c| c == value)?;
                (idx as f64 + 0.5) / choices.len() as f64
            }
            ParameterKind::Integer { low, high } => {
                let v = value.as_i64()?;
                let span = integer_span(*low, *high) as f64 + 1.0;
                ((v as i128 - *low as i128) as f64 + 0.5) / span
            }
            ParameterKind::Continuous { low, high } => {
                let v = value.as_f64()?;
                (v - low) / (high - low)
            }
            ParameterKind::LogContinuous { low, high } => {
                let v = value.as_f64()?;
                if v <= 0.0 {
                    return None;
                }
                (v.ln() - low.ln()) / (high.ln() - low.ln())
            }
        };
        Some(encoded.clamp(0.0, 1.0))
    }

    /// Inverse of [`ParameterSpec::encode`]. Any `u` maps to an in-domain value.
    pub fn decode(&self, u: f64) -> ParameterValue {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.0 };
        match &self.kind {
            ParameterKind::Categorical { choices } => {
                let idx = ((u * choices.len() as f64) as usize).min(choices.len() - 1);
                choices[idx].clone()
            }
            ParameterKind::Integer { low, high } => {
                let span = integer_span(*low, *high) as f64 + 1.0;
                let offset = (u * span).floor() as i128;
                let value = (*low as i128 + offset).clamp(*low as i128, *high as i128);
                ParameterValue::Int(value as i64)
            }
            ParameterKind::Continuous { low, high } => {
                ParameterValue::Float((low + u * (high - low)).clamp(*low, *high))
            }
            ParameterKind::LogContinuous { low, high } => {
                let log_value = low.ln() + u * (high.ln() - low.ln());
                ParameterValue::Float(log_value.exp().clamp(*low, *high))
            }
        }
    }

    /// Grid axis: every value for discrete domains, `steps` evenly spaced
    /// points (in encoded space) for continuous ones.
    pub fn grid_axis_len(&self, steps: usize) -> usize {
        self.cardinality().unwrap_or_else(|| steps.max(2))
    }

    fn grid_value(&self, index: usize, steps: usize) -> ParameterValue {
        match &self.kind {
            ParameterKind::Categorical { choices } => choices[index].clone(),
            ParameterKind::Integer { low, .. } => {
                ParameterValue::Int((*low as i128 + index as i128) as i64)
            }
            _ => {
                let steps = steps.max(2);
                self.decode(index as f64 / (steps - 1) as f64)
            }
        }
    }
}

/// `high - low` without overflow for any pair of `i64` bounds.
fn integer_span(low: i64, high: i64) -> i128 {
    high as i128 - low as i128
}

/// A named predicate every valid assignment must satisfy.
#[derive(Clone)]
pub struct Constraint {
    name: String,
    predicate: Arc<dyn Fn(&Assignment) -> bool + Send + Sync>,
}

impl Constraint {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Assignment) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holds(&self, assignment: &Assignment) -> bool {
        (self.predicate)(assignment)
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint").field("name", &self.name).finish()
    }
}

/// The full search space: ordered parameter specs plus constraints.
///
/// Immutable once built; construct it with [`SearchSpace::builder`] or
/// [`SearchSpace::from_parameters`].
#[derive(Debug, Clone)]
pub struct SearchSpace {
    parameters: Vec<ParameterSpec>,
    constraints: Vec<Constraint>,
}

impl SearchSpace {
    pub fn builder() -> SearchSpaceBuilder {
        SearchSpaceBuilder::default()
    }

    pub fn from_parameters(parameters: Vec<ParameterSpec>) -> TuneResult<Self> {
        SearchSpaceBuilder {
            parameters,
            constraints: Vec::new(),
        }
        .build()
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Keys must match exactly, every value must be in domain and every
    /// constraint must hold.
    pub fn validate(&self, assignment: &Assignment) -> Result<(), SpaceError> {
        for key in assignment.keys() {
            if self.parameter(key).is_none() {
                return Err(SpaceError::UnknownParameter {
                    parameter: key.clone(),
                });
            }
        }
        for param in &self.parameters {
            let value = assignment
                .get(&param.name)
                .ok_or_else(|| SpaceError::MissingParameter {
                    parameter: param.name.clone(),
                })?;
            param.contains(value)?;
        }
        self.check_constraints(assignment)
    }

    pub fn check_constraints(&self, assignment: &Assignment) -> Result<(), SpaceError> {
        match self.constraints.iter().find(|c| !c.holds(assignment)) {
            Some(violated) => Err(SpaceError::ConstraintViolation {
                constraint: violated.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// The default assignment, used as trial 0 when no history exists.
    pub fn sample_default(&self) -> Result<Assignment, SpaceError> {
        let assignment: Assignment = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.default_value()))
            .collect();
        self.validate(&assignment)?;
        Ok(assignment)
    }

    /// Convert integer literals given for continuous parameters into floats,
    /// e.g. for user-supplied seed assignments.
    pub fn coerce(&self, mut assignment: Assignment) -> Assignment {
        for param in &self.parameters {
            if let (
                ParameterKind::Continuous { .. } | ParameterKind::LogContinuous { .. },
                Some(ParameterValue::Int(v)),
            ) = (&param.kind, assignment.get(&param.name))
            {
                let v = *v as f64;
                assignment.insert(param.name.clone(), ParameterValue::Float(v));
            }
        }
        assignment
    }

    /// Encoded view, one unit-interval coordinate per parameter in
    /// declaration order.
    pub fn encode(&self, assignment: &Assignment) -> Result<Vec<f64>, SpaceError> {
        self.parameters
            .iter()
            .map(|p| {
                let value = assignment
                    .get(&p.name)
                    .ok_or_else(|| SpaceError::MissingParameter {
                        parameter: p.name.clone(),
                    })?;
                p.encode(value).ok_or_else(|| SpaceError::DomainViolation {
                    parameter: p.name.clone(),
                    message: format!("{value} cannot be encoded"),
                })
            })
            .collect()
    }

    /// Raw view of an encoded point. Constraints are not checked.
    pub fn decode(&self, point: &[f64]) -> Assignment {
        self.parameters
            .iter()
            .zip(point.iter().copied().chain(std::iter::repeat(0.5)))
            .map(|(p, u)| (p.name.clone(), p.decode(u)))
            .collect()
    }

    /// Total number of grid points (`None` on overflow).
    pub fn grid_size(&self, steps: usize) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            total = total.checked_mul(param.grid_axis_len(steps))?;
        }
        Some(total)
    }

    /// The `index`-th grid point in mixed-radix order (last parameter varies
    /// fastest). Returns `None` past the end of the grid.
    pub fn grid_point(&self, index: usize, steps: usize) -> Option<Assignment> {
        if index >= self.grid_size(steps)? {
            return None;
        }
        let mut remainder = index;
        let mut assignment = Assignment::new();
        for param in self.parameters.iter().rev() {
            let len = param.grid_axis_len(steps);
            assignment.insert(param.name.clone(), param.grid_value(remainder % len, steps));
            remainder /= len;
        }
        Some(assignment)
    }
}

/// Collects parameters and constraints, validating everything in `build`.
#[derive(Debug, Default)]
pub struct SearchSpaceBuilder {
    parameters: Vec<ParameterSpec>,
    constraints: Vec<Constraint>,
}

impl SearchSpaceBuilder {
    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn categorical<V: Into<ParameterValue>>(
        self,
        name: impl Into<String>,
        choices: impl IntoIterator<Item = V>,
    ) -> Self {
        let choices = choices.into_iter().map(Into::into).collect();
        self.parameter(ParameterSpec::new(name, ParameterKind::Categorical { choices }))
    }

    pub fn integer(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameter(ParameterSpec::new(name, ParameterKind::Integer { low, high }))
    }

    pub fn continuous(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameter(ParameterSpec::new(name, ParameterKind::Continuous { low, high }))
    }

    pub fn log_continuous(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameter(ParameterSpec::new(
            name,
            ParameterKind::LogContinuous { low, high },
        ))
    }

    pub fn constraint<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Assignment) -> bool + Send + Sync + 'static,
    {
        self.constraints.push(Constraint::new(name, predicate));
        self
    }

    pub fn build(self) -> TuneResult<SearchSpace> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SpaceError::DuplicateParameter {
                    parameter: param.name.clone(),
                }
                .into());
            }
            param.check()?;
        }
        Ok(SearchSpace {
            parameters: self.parameters,
            constraints: self.constraints,
        })
    }
}
