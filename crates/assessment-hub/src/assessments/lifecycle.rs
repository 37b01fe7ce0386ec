//! Status transition rules for assessments and submissions.

use super::domain::{is_blank, AssessmentId, AssessmentStatus, SubmissionStatus, UserData};
use super::error::{ServiceError, Violation};
use super::payload::SubmissionPatch;
use super::store::Tables;

const EMPTY_TITLE: &str = "title must not be empty";
const REQUIRED_FOR_COMPLETE: &str = "required before the submission can be completed";

/// Every node below `assessment_id` whose title is blank, addressed by `order_index`.
pub fn empty_titles(tables: &Tables, assessment_id: &AssessmentId) -> Vec<Violation> {
    let mut violations = Vec::new();
    for item in tables.assessment_items(assessment_id) {
        let item_path = format!("items[{}]", item.order_index);
        if is_blank(Some(&item.title)) {
            violations.push(Violation::new(format!("{item_path}.title"), EMPTY_TITLE));
        }
        for indicator in tables.indicators(&item.id) {
            let indicator_path = format!("{item_path}.indicators[{}]", indicator.order_index);
            if is_blank(Some(&indicator.title)) {
                violations.push(Violation::new(
                    format!("{indicator_path}.title"),
                    EMPTY_TITLE,
                ));
            }
            for entry in tables.indicator_items(&indicator.id) {
                if is_blank(Some(&entry.title)) {
                    violations.push(Violation::new(
                        format!("{indicator_path}.items[{}].title", entry.order_index),
                        EMPTY_TITLE,
                    ));
                }
            }
        }
    }
    violations
}

/// Gate a status write on an assessment. Only `draft -> published` is guarded.
pub fn check_assessment_transition(
    tables: &Tables,
    assessment_id: &AssessmentId,
    target: AssessmentStatus,
) -> Result<(), ServiceError> {
    if target != AssessmentStatus::Published {
        return Ok(());
    }

    let violations = empty_titles(tables, assessment_id);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Validation(violations))
    }
}

/// Gate a submission write. Completion needs performance, rate and score after the
/// patch is merged over whatever is already stored.
pub fn check_submission_transition(
    stored: Option<&UserData>,
    patch: &SubmissionPatch,
    target: SubmissionStatus,
) -> Result<(), ServiceError> {
    if target != SubmissionStatus::Complete {
        return Ok(());
    }

    let merged = |incoming: &Option<String>, current: Option<&Option<String>>| {
        incoming
            .clone()
            .or_else(|| current.cloned().flatten())
    };

    let fields = [
        (
            "performance",
            merged(&patch.performance, stored.map(|row| &row.performance)),
        ),
        ("rate", merged(&patch.rate, stored.map(|row| &row.rate))),
        ("score", merged(&patch.score, stored.map(|row| &row.score))),
    ];

    let violations: Vec<Violation> = fields
        .iter()
        .filter(|(_, value)| is_blank(value.as_deref()))
        .map(|(field, _)| Violation::new(*field, REQUIRED_FOR_COMPLETE))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Validation(violations))
    }
}
