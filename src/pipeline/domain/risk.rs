use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Low => "LOW",
            AlertLevel::Medium => "MEDIUM",
            AlertLevel::High => "HIGH",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(AlertLevel::Low),
            "MEDIUM" => Ok(AlertLevel::Medium),
            "HIGH" => Ok(AlertLevel::High),
            "CRITICAL" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown alert level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationFinding {
    pub label: String,
    pub severity: AlertLevel,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// 0..=100
    pub score: u8,
    pub level: AlertLevel,
    pub per_violation: Vec<ViolationFinding>,
}

/// Which scorer produced the assessment of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScoringPath {
    Reasoning,
    RuleBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub min_score: u8,
    pub level: AlertLevel,
}

/// Score to alert level table. A score maps to the level of the highest
/// breakpoint whose `min_score` it reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertBreakpoints(Vec<Breakpoint>);

impl AlertBreakpoints {
    pub fn new(breakpoints: Vec<Breakpoint>) -> Result<Self, String> {
        let table = Self(breakpoints);
        table.validate()?;
        Ok(table)
    }

    /// The table must start at 0 and rise strictly in both score and level.
    pub fn validate(&self) -> Result<(), String> {
        let first = self
            .0
            .first()
            .ok_or_else(|| "alert breakpoints must not be empty".to_string())?;
        if first.min_score != 0 {
            return Err("first alert breakpoint must start at score 0".to_string());
        }
        for pair in self.0.windows(2) {
            if pair[1].min_score <= pair[0].min_score || pair[1].level <= pair[0].level {
                return Err(format!(
                    "alert breakpoints must be strictly increasing ({} at {} then {} at {})",
                    pair[0].level, pair[0].min_score, pair[1].level, pair[1].min_score
                ));
            }
        }
        Ok(())
    }

    pub fn level_for(&self, score: u8) -> AlertLevel {
        self.0
            .iter()
            .rev()
            .find(|bp| score >= bp.min_score)
            .map(|bp| bp.level)
            .unwrap_or(AlertLevel::Low)
    }
}

impl Default for AlertBreakpoints {
    fn default() -> Self {
        Self(vec![
            Breakpoint {
                min_score: 0,
                level: AlertLevel::Low,
            },
            Breakpoint {
                min_score: 25,
                level: AlertLevel::Medium,
            },
            Breakpoint {
                min_score: 50,
                level: AlertLevel::High,
            },
            Breakpoint {
                min_score: 75,
                level: AlertLevel::Critical,
            },
        ])
    }
}
