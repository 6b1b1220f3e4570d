use std::fmt::Write;

use tracing::{info, instrument, warn};

use super::guard::GuardedCall;
use crate::error::PipelineError;
use crate::pipeline::domain::{AlertMessage, ReportPaths, RiskAssessment};

/// Builds alert messages and hands them to the notification channel, if any.
pub struct AlertDispatcher {
    channel: Option<GuardedCall<AlertMessage, ()>>,
}

impl AlertDispatcher {
    pub fn new(channel: Option<GuardedCall<AlertMessage, ()>>) -> Self {
        Self { channel }
    }

    pub fn is_configured(&self) -> bool {
        self.channel.is_some()
    }

    pub fn message(
        assessment: &RiskAssessment,
        equipment_present: &[String],
        report: Option<&ReportPaths>,
    ) -> AlertMessage {
        let subject = format!(
            "[{}] Construction Safety Alert - Risk Score: {}",
            assessment.level, assessment.score
        );

        let mut body = String::from("Construction Safety Alert\n=========================\n");
        let _ = writeln!(body, "Alert Level : {}", assessment.level);
        let _ = writeln!(body, "Risk Score  : {}/100", assessment.score);
        body.push_str("\nViolations Detected:\n");
        if assessment.per_violation.is_empty() {
            body.push_str("None\n");
        }
        for finding in &assessment.per_violation {
            let _ = writeln!(body, "- {} ({}): {}", finding.label, finding.severity, finding.rationale);
        }
        let equipment = if equipment_present.is_empty() {
            "N/A".to_string()
        } else {
            equipment_present.join(", ")
        };
        let _ = write!(body, "\nEquipment Context: {}", equipment);
        if let Some(report) = report {
            let _ = write!(body, "\nReport: {}", report.pdf.display());
        }

        AlertMessage { subject, body }
    }

    /// Publishes once. `Ok(false)` when no channel is configured.
    #[instrument(skip_all, fields(subject = %message.subject))]
    pub async fn dispatch(&self, message: AlertMessage) -> Result<bool, PipelineError> {
        let Some(channel) = &self.channel else {
            info!("No notification channel configured, skipping alert");
            return Ok(false);
        };
        match channel.call(message).await {
            Ok(()) => {
                info!("Alert published");
                Ok(true)
            }
            Err(e) => {
                warn!("Alert could not be published: {}", e);
                Err(PipelineError::NotificationFailure(e.to_string()))
            }
        }
    }
}
