use log::debug;
use serde::Serialize;

use super::parser::ParseResult;
use crate::db::{StoreError, StudentDirectory};
use crate::models::Student;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Id, name and surname all agree with the directory.
    Exact,
    /// The id exists but the names differ.
    Partial,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub matched_student: Option<Student>,
    pub match_type: MatchType,
}

impl ValidationResult {
    fn unmatched() -> Self {
        Self { is_valid: false, matched_student: None, match_type: MatchType::None }
    }
}

fn fold(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

fn same_name(parsed: Option<&str>, registered: &str) -> bool {
    parsed.is_some_and(|p| fold(p) == fold(registered))
}

/// Checks parsed card fields against the student directory.
///
/// A record found under the parsed id is a valid match; `Partial` tells the
/// caller to ask the student to confirm before going on.
pub async fn validate_parsed_data(
    directory: &dyn StudentDirectory,
    parsed: &ParseResult,
) -> Result<ValidationResult, StoreError> {
    let Some(student_id) = parsed.id.as_deref() else {
        return Ok(ValidationResult::unmatched());
    };
    let Some(student) = directory.find_student(student_id).await? else {
        debug!("No student registered under parsed id");
        return Ok(ValidationResult::unmatched());
    };

    let match_type = if same_name(parsed.name.as_deref(), &student.name)
        && same_name(parsed.surname.as_deref(), &student.surname)
    {
        MatchType::Exact
    } else {
        MatchType::Partial
    };

    Ok(ValidationResult { is_valid: true, matched_student: Some(student), match_type })
}
