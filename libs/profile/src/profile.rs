//! Profiles and profile state tracking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ExpressionError;
use crate::eval::Variables;
use crate::expr::Expression;

/// A named boolean condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    name: String,
    expression: Expression,
    required: Vec<String>,
}

impl Condition {
    /// Parse a condition's expression.
    pub fn parse(name: impl Into<String>, expression: &str) -> Result<Self, ExpressionError> {
        let expression = Expression::parse(expression)?;
        let required = expression.variables();
        Ok(Self {
            name: name.into(),
            expression,
            required,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// Variables the expression reads.
    pub fn required_variables(&self) -> &[String] {
        &self.required
    }

    pub fn evaluate(&self, variables: &Variables) -> Result<bool, ExpressionError> {
        self.expression.evaluate(variables)
    }
}

/// A condition that failed to parse or evaluate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("profile '{profile}' condition '{condition}': {error}")]
pub struct ConditionError {
    pub profile: String,
    pub condition: String,
    pub error: ExpressionError,
}

/// A named, ordered list of conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    name: String,
    conditions: Vec<Condition>,
}

impl Profile {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            name: name.into(),
            conditions,
        }
    }

    /// Build a profile from `(condition name, expression)` pairs.
    ///
    /// Conditions that fail to parse are left out and returned as errors.
    pub fn parse<I, N, E>(name: impl Into<String>, conditions: I) -> (Self, Vec<ConditionError>)
    where
        I: IntoIterator<Item = (N, E)>,
        N: Into<String>,
        E: AsRef<str>,
    {
        let name = name.into();
        let mut parsed = Vec::new();
        let mut errors = Vec::new();

        for (condition, expression) in conditions {
            let condition = condition.into();
            match Condition::parse(condition.clone(), expression.as_ref()) {
                Ok(c) => parsed.push(c),
                Err(error) => errors.push(ConditionError {
                    profile: name.clone(),
                    condition,
                    error,
                }),
            }
        }

        (Self::new(name, parsed), errors)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Name of the first condition that evaluates to true.
    ///
    /// Every condition is evaluated; failing ones are reported and treated
    /// as not matching.
    pub fn evaluate(&self, variables: &Variables) -> (Option<String>, Vec<ConditionError>) {
        let mut state = None;
        let mut errors = Vec::new();

        for condition in &self.conditions {
            match condition.evaluate(variables) {
                Ok(true) if state.is_none() => state = Some(condition.name.clone()),
                Ok(_) => {}
                Err(error) => errors.push(ConditionError {
                    profile: self.name.clone(),
                    condition: condition.name.clone(),
                    error,
                }),
            }
        }

        (state, errors)
    }
}

/// A profile's state changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub profile: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// Result of one evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationReport {
    pub events: Vec<ProfileEvent>,
    pub errors: Vec<ConditionError>,
}

/// Tracks the state of every configured profile.
#[derive(Debug, Default)]
pub struct ProfileEvaluator {
    profiles: Vec<Profile>,
    states: HashMap<String, Option<String>>,
}

impl ProfileEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Current state of a profile, `None` if unknown or no condition matched.
    pub fn state(&self, profile: &str) -> Option<&str> {
        self.states.get(profile).and_then(|s| s.as_deref())
    }

    /// Replace the profile set. States of profiles that remain are kept.
    pub fn set_profiles(&mut self, profiles: Vec<Profile>) {
        self.states
            .retain(|name, _| profiles.iter().any(|p| p.name() == name));
        self.profiles = profiles;
    }

    /// Evaluate every profile and report state changes.
    pub fn evaluate(&mut self, variables: &Variables) -> EvaluationReport {
        let mut report = EvaluationReport::default();

        for profile in &self.profiles {
            let (current, errors) = profile.evaluate(variables);
            report.errors.extend(errors);

            let previous = self.states.get(profile.name()).cloned().flatten();
            if previous != current {
                report.events.push(ProfileEvent {
                    profile: profile.name().to_string(),
                    previous,
                    current: current.clone(),
                });
            }
            self.states.insert(profile.name().to_string(), current);
        }

        report
    }
}
