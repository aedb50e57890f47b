//! Structural comparison of legacy and candidate results.
//!
//! Used only for canary observability: a mismatch is logged, counted and
//! broadcast, but never changes what the caller receives.

use crate::engine::ExecutionResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Severity of a discrepancy. Only `Critical` affects `overall_match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Files the legacy engine produced but the candidate did not.
    MissingFiles,
    /// Files only the candidate produced.
    ExtraFiles,
    ContentMismatch,
    ModelCountMismatch,
    SuccessMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    #[serde(rename = "type")]
    pub kind: DiscrepancyKind,
    pub description: String,
    pub severity: Severity,
}

impl Discrepancy {
    fn critical(kind: DiscrepancyKind, description: String) -> Self {
        Self {
            kind,
            description,
            severity: Severity::Critical,
        }
    }

    fn warning(kind: DiscrepancyKind, description: String) -> Self {
        Self {
            kind,
            description,
            severity: Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub legacy_time_ms: f64,
    pub new_time_ms: f64,
    /// `(new - legacy) / legacy * 100`; negative means the candidate is faster.
    pub delta_percent: f64,
}

impl PerformanceAnalysis {
    pub fn between(legacy_seconds: f64, candidate_seconds: f64) -> Self {
        let legacy_time_ms = legacy_seconds * 1000.0;
        let new_time_ms = candidate_seconds * 1000.0;
        let delta_percent = if legacy_time_ms > 0.0 {
            (new_time_ms - legacy_time_ms) / legacy_time_ms * 100.0
        } else {
            0.0
        };
        Self {
            legacy_time_ms,
            new_time_ms,
            delta_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub overall_match: bool,
    pub critical_discrepancies: Vec<Discrepancy>,
    pub warning_discrepancies: Vec<Discrepancy>,
    pub performance_analysis: PerformanceAnalysis,
}

impl ComparisonResult {
    pub fn discrepancies(&self) -> impl Iterator<Item = &Discrepancy> {
        self.critical_discrepancies
            .iter()
            .chain(self.warning_discrepancies.iter())
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "match={} critical={} warnings={} delta={:+.1}%",
            self.overall_match,
            self.critical_discrepancies.len(),
            self.warning_discrepancies.len(),
            self.performance_analysis.delta_percent
        )
    }
}

/// Strips run-to-run noise from generated file content before diffing.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, path: &str, content: &str) -> String;
}

/// Default normalizer: timestamps, "Generated at/on" banners and
/// trailing whitespace.
pub struct TimestampNormalizer {
    rules: Vec<(Regex, &'static str)>,
}

impl TimestampNormalizer {
    const RULES: [(&'static str, &'static str); 3] = [
        (r"(?mi)\b(generated (?:at|on))\b.*$", "$1 <normalized>"),
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<timestamp>",
        ),
        (r"(?m)[ \t]+$", ""),
    ];

    pub fn new() -> Self {
        let rules = Self::RULES
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(regex) => Some((regex, *replacement)),
                Err(err) => {
                    warn!("Skipping normalization rule {:?}: {}", pattern, err);
                    None
                }
            })
            .collect();
        Self { rules }
    }
}

impl Default for TimestampNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer for TimestampNormalizer {
    fn normalize(&self, _path: &str, content: &str) -> String {
        self.rules
            .iter()
            .fold(content.to_string(), |acc, (regex, replacement)| {
                regex.replace_all(&acc, *replacement).into_owned()
            })
    }
}

#[derive(Clone)]
pub struct OutputComparator {
    normalizer: Arc<dyn Normalizer>,
}

impl Default for OutputComparator {
    fn default() -> Self {
        Self::new(Arc::new(TimestampNormalizer::new()))
    }
}

impl OutputComparator {
    pub fn new(normalizer: Arc<dyn Normalizer>) -> Self {
        Self { normalizer }
    }

    /// Compare a legacy result against a candidate result.
    pub fn compare(&self, legacy: &ExecutionResult, candidate: &ExecutionResult) -> ComparisonResult {
        let mut critical = Vec::new();
        let mut warnings = Vec::new();

        if legacy.success != candidate.success {
            critical.push(Discrepancy::critical(
                DiscrepancyKind::SuccessMismatch,
                format!(
                    "legacy success={}, candidate success={}",
                    legacy.success, candidate.success
                ),
            ));
        }

        let legacy_files: BTreeMap<&str, &str> = legacy
            .generated_files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_str()))
            .collect();
        let candidate_files: BTreeMap<&str, &str> = candidate
            .generated_files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_str()))
            .collect();

        let missing: Vec<&str> = legacy_files
            .keys()
            .filter(|path| !candidate_files.contains_key(*path))
            .copied()
            .collect();
        let extra: Vec<&str> = candidate_files
            .keys()
            .filter(|path| !legacy_files.contains_key(*path))
            .copied()
            .collect();

        if !missing.is_empty() {
            critical.push(Discrepancy::critical(
                DiscrepancyKind::MissingFiles,
                format!("candidate did not generate: {}", missing.join(", ")),
            ));
        }
        if !extra.is_empty() {
            critical.push(Discrepancy::critical(
                DiscrepancyKind::ExtraFiles,
                format!("candidate generated unexpected: {}", extra.join(", ")),
            ));
        }

        for (path, legacy_content) in &legacy_files {
            let Some(candidate_content) = candidate_files.get(path) else {
                continue;
            };
            if legacy_content == candidate_content {
                continue;
            }
            let lhs = self.normalizer.normalize(path, legacy_content);
            let rhs = self.normalizer.normalize(path, candidate_content);
            if lhs != rhs {
                critical.push(Discrepancy::critical(
                    DiscrepancyKind::ContentMismatch,
                    format!("content differs in {path}{}", first_difference(&lhs, &rhs)),
                ));
            }
        }

        if missing.is_empty()
            && extra.is_empty()
            && legacy.generated_models.len() != candidate.generated_models.len()
        {
            warnings.push(Discrepancy::warning(
                DiscrepancyKind::ModelCountMismatch,
                format!(
                    "legacy reported {} models, candidate {}",
                    legacy.generated_models.len(),
                    candidate.generated_models.len()
                ),
            ));
        }

        ComparisonResult {
            overall_match: critical.is_empty(),
            critical_discrepancies: critical,
            warning_discrepancies: warnings,
            performance_analysis: PerformanceAnalysis::between(
                legacy.execution_time_seconds,
                candidate.execution_time_seconds,
            ),
        }
    }
}

fn first_difference(lhs: &str, rhs: &str) -> String {
    lhs.lines()
        .zip(rhs.lines())
        .position(|(a, b)| a != b)
        .map(|idx| format!(" (first differing line {})", idx + 1))
        .unwrap_or_default()
}
