use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// VB6-compatible 1-decimal rounding kept for grade display parity:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Submitted,
    Graded,
    Returned,
    Resubmitted,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Graded => "graded",
            SubmissionStatus::Returned => "returned",
            SubmissionStatus::Resubmitted => "resubmitted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(SubmissionStatus::Submitted),
            "graded" => Some(SubmissionStatus::Graded),
            "returned" => Some(SubmissionStatus::Returned),
            "resubmitted" => Some(SubmissionStatus::Resubmitted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionType {
    Text,
    FileUpload,
    Both,
}

impl SubmissionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionType::Text => "text",
            SubmissionType::FileUpload => "file_upload",
            SubmissionType::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(SubmissionType::Text),
            "file_upload" => Some(SubmissionType::FileUpload),
            "both" => Some(SubmissionType::Both),
            _ => None,
        }
    }
}

/// Opaque reference to an already-stored attachment. The upload collaborator
/// owns the bytes; this core only carries the metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub url: String,
}

/// Submitted work, tagged by the shape the assignment declared. Construction
/// goes through `validate_content` so a mismatched payload can never reach the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionContent {
    Text { text: String },
    Files { files: Vec<FileRef> },
    TextAndFiles { text: String, files: Vec<FileRef> },
}

impl SubmissionContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            SubmissionContent::Text { text } => Some(text),
            SubmissionContent::Files { .. } => None,
            SubmissionContent::TextAndFiles { text, .. } => Some(text),
        }
    }

    pub fn files(&self) -> &[FileRef] {
        match self {
            SubmissionContent::Text { .. } => &[],
            SubmissionContent::Files { files } => files,
            SubmissionContent::TextAndFiles { files, .. } => files,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LifecycleError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn policy_violation(message: impl Into<String>) -> LifecycleError {
    LifecycleError::new("policy_violation", message)
}

fn validation_error(message: impl Into<String>) -> LifecycleError {
    LifecycleError::new("validation_error", message)
}

/// The slice of an assignment the lifecycle consults. Read-only here; the
/// assignment handlers own creation and edits.
#[derive(Debug, Clone)]
pub struct AssignmentPolicy {
    pub due_date: DateTime<Utc>,
    pub max_points: f64,
    pub submission_type: SubmissionType,
    pub allow_late_submission: bool,
    pub late_penalty: f64,
    pub allow_resubmission: bool,
    pub max_resubmissions: i64,
    pub resubmission_deadline: Option<DateTime<Utc>>,
}

impl AssignmentPolicy {
    /// Field-level checks applied when a teacher creates or edits an
    /// assignment. latePenalty/maxResubmissions are validated even when their
    /// enabling flag is off so a later flag flip cannot expose a bad value.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.max_points <= 0.0 {
            return Err(validation_error("maxPoints must be > 0")
                .with_details(json!({ "field": "maxPoints", "value": self.max_points })));
        }
        if !(0.0..=100.0).contains(&self.late_penalty) {
            return Err(validation_error("latePenalty must be between 0 and 100")
                .with_details(json!({ "field": "latePenalty", "value": self.late_penalty })));
        }
        if self.max_resubmissions < 1 {
            return Err(validation_error("maxResubmissions must be >= 1").with_details(
                json!({ "field": "maxResubmissions", "value": self.max_resubmissions }),
            ));
        }
        Ok(())
    }
}

/// Checks a payload against the assignment's declared shape and tags it.
/// Presence is required for every declared part; parts the type does not
/// declare are rejected rather than silently dropped.
pub fn validate_content(
    submission_type: SubmissionType,
    text: Option<&str>,
    files: Vec<FileRef>,
) -> Result<SubmissionContent, LifecycleError> {
    let text = text.map(str::trim).filter(|t| !t.is_empty());
    match submission_type {
        SubmissionType::Text => {
            if !files.is_empty() {
                return Err(policy_violation(
                    "assignment accepts text only, file attachments are not allowed",
                )
                .with_details(json!({ "submissionType": "text", "fileCount": files.len() })));
            }
            let text = text.ok_or_else(|| {
                policy_violation("assignment requires a text submission")
                    .with_details(json!({ "submissionType": "text" }))
            })?;
            Ok(SubmissionContent::Text {
                text: text.to_string(),
            })
        }
        SubmissionType::FileUpload => {
            if text.is_some() {
                return Err(policy_violation(
                    "assignment accepts file uploads only, text is not allowed",
                )
                .with_details(json!({ "submissionType": "file_upload" })));
            }
            if files.is_empty() {
                return Err(policy_violation("assignment requires at least one file")
                    .with_details(json!({ "submissionType": "file_upload" })));
            }
            Ok(SubmissionContent::Files { files })
        }
        SubmissionType::Both => {
            let text = text.ok_or_else(|| {
                policy_violation("assignment requires both text and files; text is missing")
                    .with_details(json!({ "submissionType": "both", "missing": "text" }))
            })?;
            if files.is_empty() {
                return Err(policy_violation(
                    "assignment requires both text and files; files are missing",
                )
                .with_details(json!({ "submissionType": "both", "missing": "files" })));
            }
            Ok(SubmissionContent::TextAndFiles {
                text: text.to_string(),
                files,
            })
        }
    }
}

/// First-submit guard. Returns the computed lateness flag.
/// A late submit with no late policy is a hard cutoff.
pub fn check_submit(
    policy: &AssignmentPolicy,
    now: DateTime<Utc>,
) -> Result<bool, LifecycleError> {
    let is_late = now > policy.due_date;
    if is_late && !policy.allow_late_submission {
        return Err(policy_violation("assignment is past due and does not accept late submissions")
            .with_details(json!({
                "dueDate": policy.due_date.to_rfc3339(),
                "submittedAt": now.to_rfc3339(),
            })));
    }
    Ok(is_late)
}

/// Resubmit guard. Lateness is recomputed against the original due date but is
/// informational here; the resubmission deadline is what can reject.
pub fn check_resubmit(
    policy: &AssignmentPolicy,
    current_version: i64,
    now: DateTime<Utc>,
) -> Result<bool, LifecycleError> {
    if !policy.allow_resubmission {
        return Err(policy_violation("assignment does not allow resubmission"));
    }
    if current_version >= policy.max_resubmissions {
        return Err(
            policy_violation("resubmission limit reached").with_details(json!({
                "currentVersion": current_version,
                "maxResubmissions": policy.max_resubmissions,
            })),
        );
    }
    if let Some(deadline) = policy.resubmission_deadline {
        if now > deadline {
            return Err(
                policy_violation("resubmission deadline has passed").with_details(json!({
                    "resubmissionDeadline": deadline.to_rfc3339(),
                    "submittedAt": now.to_rfc3339(),
                })),
            );
        }
    }
    Ok(now > policy.due_date)
}

/// A numeric grade may only land on work awaiting it.
pub fn check_gradeable(status: SubmissionStatus) -> Result<(), LifecycleError> {
    match status {
        SubmissionStatus::Submitted | SubmissionStatus::Resubmitted => Ok(()),
        other => Err(policy_violation(format!(
            "submission cannot be graded from status '{}'",
            other.as_str()
        ))),
    }
}

pub fn check_returnable(status: SubmissionStatus) -> Result<(), LifecycleError> {
    match status {
        SubmissionStatus::Graded => Ok(()),
        other => Err(policy_violation(format!(
            "only graded submissions can be returned, not '{}'",
            other.as_str()
        ))),
    }
}

pub fn check_grade_value(grade: f64, max_points: f64) -> Result<(), LifecycleError> {
    if !grade.is_finite() || grade < 0.0 || grade > max_points {
        return Err(validation_error("grade must be between 0 and maxPoints")
            .with_details(json!({ "field": "grade", "value": grade, "maxPoints": max_points })));
    }
    Ok(())
}

/// Display value for a grade: the late penalty shaves a percentage off the raw
/// mark for submissions accepted under an allow-late policy. The raw value is
/// persisted alongside so no information is lost.
pub fn effective_grade(raw: f64, is_late: bool, policy: &AssignmentPolicy) -> f64 {
    if is_late && policy.allow_late_submission && policy.late_penalty > 0.0 {
        round_off_1_decimal(raw * (1.0 - policy.late_penalty / 100.0))
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(allow_late: bool, penalty: f64) -> AssignmentPolicy {
        AssignmentPolicy {
            due_date: Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 59).unwrap(),
            max_points: 100.0,
            submission_type: SubmissionType::Text,
            allow_late_submission: allow_late,
            late_penalty: penalty,
            allow_resubmission: true,
            max_resubmissions: 2,
            resubmission_deadline: None,
        }
    }

    #[test]
    fn round_off_matches_vb6() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(80.95), 81.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
    }

    #[test]
    fn late_penalty_applies_only_under_allow_late() {
        let p = policy(true, 10.0);
        assert_eq!(effective_grade(90.0, true, &p), 81.0);
        assert_eq!(effective_grade(90.0, false, &p), 90.0);

        let no_penalty = policy(true, 0.0);
        assert_eq!(effective_grade(90.0, true, &no_penalty), 90.0);
    }

    #[test]
    fn submit_past_due_without_late_policy_is_rejected() {
        let p = policy(false, 0.0);
        let after = Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap();
        let err = check_submit(&p, after).unwrap_err();
        assert_eq!(err.code, "policy_violation");

        let before = Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap();
        assert_eq!(check_submit(&p, before).unwrap(), false);

        let p = policy(true, 10.0);
        assert_eq!(check_submit(&p, after).unwrap(), true);
    }

    #[test]
    fn resubmit_cap_counts_versions_not_attempts() {
        let p = policy(true, 0.0);
        let now = Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap();
        // cap 2: version 1 may bump to 2, version 2 may not bump to 3
        assert!(check_resubmit(&p, 1, now).is_ok());
        let err = check_resubmit(&p, 2, now).unwrap_err();
        assert_eq!(err.code, "policy_violation");
    }

    #[test]
    fn resubmit_respects_deadline_and_flag() {
        let mut p = policy(true, 0.0);
        p.resubmission_deadline = Some(Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        let late = Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(check_resubmit(&p, 1, late).unwrap_err().code, "policy_violation");

        p.allow_resubmission = false;
        let early = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(check_resubmit(&p, 1, early).unwrap_err().code, "policy_violation");
    }

    #[test]
    fn resubmit_after_due_is_flagged_late_but_allowed() {
        let p = policy(true, 10.0);
        let after_due = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(check_resubmit(&p, 1, after_due).unwrap(), true);
    }

    #[test]
    fn content_must_match_declared_type() {
        let file = FileRef {
            name: "essay.pdf".into(),
            size: 1024,
            mime_type: "application/pdf".into(),
            url: "store://essay.pdf".into(),
        };

        assert!(validate_content(SubmissionType::Text, Some("answer"), vec![]).is_ok());
        assert_eq!(
            validate_content(SubmissionType::Text, Some("  "), vec![])
                .unwrap_err()
                .code,
            "policy_violation"
        );
        assert!(
            validate_content(SubmissionType::FileUpload, None, vec![file.clone()]).is_ok()
        );
        assert_eq!(
            validate_content(SubmissionType::FileUpload, None, vec![])
                .unwrap_err()
                .code,
            "policy_violation"
        );
        assert_eq!(
            validate_content(SubmissionType::Both, Some("answer"), vec![])
                .unwrap_err()
                .code,
            "policy_violation"
        );
        let both = validate_content(SubmissionType::Both, Some("answer"), vec![file]).unwrap();
        assert_eq!(both.text(), Some("answer"));
        assert_eq!(both.files().len(), 1);
    }

    #[test]
    fn grade_transitions_guarded_by_status() {
        assert!(check_gradeable(SubmissionStatus::Submitted).is_ok());
        assert!(check_gradeable(SubmissionStatus::Resubmitted).is_ok());
        assert!(check_gradeable(SubmissionStatus::Returned).is_err());
        assert!(check_returnable(SubmissionStatus::Graded).is_ok());
        assert!(check_returnable(SubmissionStatus::Submitted).is_err());
    }

    #[test]
    fn grade_value_range() {
        assert!(check_grade_value(0.0, 100.0).is_ok());
        assert!(check_grade_value(100.0, 100.0).is_ok());
        assert_eq!(check_grade_value(-1.0, 100.0).unwrap_err().code, "validation_error");
        assert_eq!(check_grade_value(101.0, 100.0).unwrap_err().code, "validation_error");
    }
}
