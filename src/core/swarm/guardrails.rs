//! Rule evaluation over a run's combined output.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::core::error::{SwarmError, SwarmResult};

static ERROR_LINE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    RegexBuilder::new(r"\b(error|fatal|panic)\b")
        .case_insensitive(true)
        .build()
        .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    RegexMatch,
    RegexReject,
    MinLines,
    MaxErrors,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::RegexMatch => "regex_match",
            RuleType::RegexReject => "regex_reject",
            RuleType::MinLines => "min_lines",
            RuleType::MaxErrors => "max_errors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    #[default]
    Halt,
    Warn,
}

impl GuardrailAction {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailAction::Halt => "halt",
            GuardrailAction::Warn => "warn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailRule {
    #[serde(rename = "type", alias = "rule_type")]
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
    #[serde(default)]
    pub action: GuardrailAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
    pub action: GuardrailAction,
    pub passed: bool,
    pub detail: String,
}

impl GuardrailRule {
    /// Checks a rule before it is stored. Invalid patterns are still
    /// tolerated at evaluation time; this only catches obvious mistakes.
    pub fn validate(&self) -> SwarmResult<()> {
        match self.rule_type {
            RuleType::RegexMatch | RuleType::RegexReject => {
                if let Some(p) = &self.pattern {
                    Regex::new(p).map_err(|e| SwarmError::InvalidPattern(e.to_string()))?;
                }
            }
            RuleType::MinLines | RuleType::MaxErrors => {
                if self.threshold.is_some_and(|t| t < 0) {
                    return Err(SwarmError::validation(format!(
                        "{} threshold must not be negative",
                        self.rule_type.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, output: &str) -> GuardrailResult {
        let (passed, detail) = match self.rule_type {
            RuleType::RegexMatch => match self.pattern.as_deref() {
                None => (false, "no pattern configured".to_string()),
                Some(p) => match Regex::new(p) {
                    Err(e) => (false, format!("invalid regex: {e}")),
                    Ok(re) if re.is_match(output) => (true, format!("pattern '{p}' found")),
                    Ok(_) => (false, format!("pattern '{p}' not found")),
                },
            },
            RuleType::RegexReject => match self.pattern.as_deref() {
                None => (true, "no pattern configured".to_string()),
                Some(p) => match Regex::new(p) {
                    Err(e) => (false, format!("invalid regex: {e}")),
                    Ok(re) => match re.find(output) {
                        Some(m) => (false, format!("rejected pattern '{p}' found: {}", m.as_str())),
                        None => (true, format!("pattern '{p}' absent")),
                    },
                },
            },
            RuleType::MinLines => {
                let lines = output.lines().count();
                let threshold = self.threshold.unwrap_or(0).max(0) as usize;
                (
                    lines >= threshold,
                    format!("{lines} lines (minimum {threshold})"),
                )
            }
            RuleType::MaxErrors => {
                let errors = count_error_lines(output);
                let threshold = self.threshold.unwrap_or(0).max(0) as usize;
                (
                    errors <= threshold,
                    format!("{errors} error lines (maximum {threshold})"),
                )
            }
        };
        GuardrailResult {
            rule_type: self.rule_type,
            pattern: self.pattern.clone(),
            threshold: self.threshold,
            action: self.action,
            passed,
            detail,
        }
    }
}

/// Lines mentioning error, fatal or panic as whole words, any case.
pub fn count_error_lines(output: &str) -> usize {
    let Some(re) = ERROR_LINE_RE.as_ref() else {
        return 0;
    };
    output.lines().filter(|l| re.is_match(l)).count()
}

/// Evaluates every rule in order. One bad rule never stops the others.
pub fn evaluate(rules: &[GuardrailRule], output: &str) -> Vec<GuardrailResult> {
    rules.iter().map(|r| r.evaluate(output)).collect()
}

/// True iff some failed rule carries `halt`.
pub fn halted(results: &[GuardrailResult]) -> bool {
    results
        .iter()
        .any(|r| !r.passed && r.action == GuardrailAction::Halt)
}
