//! Field maps for the certificate and transcript templates.
//!
//! Transcript templates address units positionally (`UNIT_<n>_NAME`,
//! `UNIT_<n>_CREDITS`) with a fixed number of slots. Units past the last
//! slot are not printed; unused slots are set to empty strings.

use chrono::NaiveDate;

use super::common::{format_certificate_date, resolve_display_name};
use crate::models::{ClaimContext, CourseUnit, FieldMap};

/// Number of unit slots a transcript template provides.
pub const MAX_TRANSCRIPT_UNITS: usize = 25;

pub const REGISTRATION_NO: &str = "REGISTRATION_NO";
pub const STUDENT_NAME: &str = "STUDENT_NAME";
pub const COURSE_NAME: &str = "COURSE_NAME";
pub const COURSE_LEVEL: &str = "COURSE_LEVEL";
pub const DATE_OF_ISSUANCE: &str = "DATE_OF_ISSUANCE";
pub const COMPLETION_DATE: &str = "COMPLETION_DATE";
pub const TOTAL_CREDITS: &str = "TOTAL_CREDITS";

pub fn unit_name_key(slot: usize) -> String {
    format!("UNIT_{}_NAME", slot)
}

pub fn unit_credits_key(slot: usize) -> String {
    format!("UNIT_{}_CREDITS", slot)
}

/// Claim-time override, then account name.
pub fn student_name(ctx: &ClaimContext) -> String {
    resolve_display_name(&[
        ctx.claim.student_name.as_deref(),
        Some(ctx.student.full_name.as_str()),
    ])
}

/// Certificate name override, then selected course name, then course title.
pub fn course_name(ctx: &ClaimContext) -> String {
    resolve_display_name(&[
        ctx.claim.certificate_name.as_deref(),
        ctx.claim.selected_course_name.as_deref(),
        Some(ctx.course.title.as_str()),
    ])
}

fn completion_date(ctx: &ClaimContext) -> NaiveDate {
    ctx.claim
        .completed_at
        .unwrap_or(ctx.claim.claimed_at)
        .date_naive()
}

fn common_fields(ctx: &ClaimContext, registration_number: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(REGISTRATION_NO.to_string(), registration_number.to_string());
    fields.insert(STUDENT_NAME.to_string(), student_name(ctx));
    fields.insert(COURSE_NAME.to_string(), course_name(ctx));
    fields.insert(
        COMPLETION_DATE.to_string(),
        format_certificate_date(completion_date(ctx)),
    );
    fields
}

pub fn certificate_fields(
    ctx: &ClaimContext,
    registration_number: &str,
    issued_on: NaiveDate,
) -> FieldMap {
    let mut fields = common_fields(ctx, registration_number);
    fields.insert(
        DATE_OF_ISSUANCE.to_string(),
        format_certificate_date(issued_on),
    );
    fields
}

pub fn transcript_fields(
    ctx: &ClaimContext,
    registration_number: &str,
    units: &[CourseUnit],
) -> FieldMap {
    let mut fields = common_fields(ctx, registration_number);
    fields.insert(
        COURSE_LEVEL.to_string(),
        ctx.course.level.clone().unwrap_or_default(),
    );

    if units.len() > MAX_TRANSCRIPT_UNITS {
        log::warn!(
            "Course {} has {} units, transcript shows the first {}",
            ctx.course.id,
            units.len(),
            MAX_TRANSCRIPT_UNITS
        );
    }

    for slot in 1..=MAX_TRANSCRIPT_UNITS {
        let (name, credits) = match units.get(slot - 1) {
            Some(unit) => (unit.title.clone(), unit.credits.to_string()),
            None => (String::new(), String::new()),
        };
        fields.insert(unit_name_key(slot), name);
        fields.insert(unit_credits_key(slot), credits);
    }

    let total: u32 = units
        .iter()
        .take(MAX_TRANSCRIPT_UNITS)
        .map(|u| u.credits)
        .sum();
    fields.insert(TOTAL_CREDITS.to_string(), total.to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompletionClaim, CourseCategory, CourseRecord, StudentRecord};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn context() -> ClaimContext {
        let course_id = Uuid::new_v4();
        let student_id = Uuid::new_v4();
        ClaimContext {
            claim: CompletionClaim {
                id: Uuid::new_v4(),
                student_id,
                course_id,
                course_category: CourseCategory::Cpd,
                student_name: None,
                certificate_name: None,
                selected_course_name: None,
                completed_at: Some(Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()),
                claimed_at: Utc.with_ymd_and_hms(2025, 6, 11, 9, 0, 0).unwrap(),
            },
            course: CourseRecord {
                id: course_id,
                title: "Safeguarding Level 2".to_string(),
                level: Some("Level 2".to_string()),
            },
            student: StudentRecord {
                id: student_id,
                full_name: "Aisha Khan".to_string(),
            },
        }
    }

    fn units(n: u32) -> Vec<CourseUnit> {
        (1..=n)
            .map(|i| CourseUnit::new(i, format!("Unit {} title", i), Some(i)))
            .collect()
    }

    #[test]
    fn test_name_resolution_prefers_overrides() {
        let mut ctx = context();
        assert_eq!(student_name(&ctx), "Aisha Khan");
        assert_eq!(course_name(&ctx), "Safeguarding Level 2");

        ctx.claim.student_name = Some("A. Khan".to_string());
        ctx.claim.selected_course_name = Some("Safeguarding (Adults)".to_string());
        assert_eq!(student_name(&ctx), "A. Khan");
        assert_eq!(course_name(&ctx), "Safeguarding (Adults)");

        ctx.claim.certificate_name = Some("Safeguarding Adults L2".to_string());
        assert_eq!(course_name(&ctx), "Safeguarding Adults L2");
    }

    #[test]
    fn test_certificate_fields() {
        let ctx = context();
        let issued = NaiveDate::from_ymd_opt(2025, 6, 13).unwrap();
        let fields = certificate_fields(&ctx, "REG-00007", issued);

        assert_eq!(fields[REGISTRATION_NO], "REG-00007");
        assert_eq!(fields[DATE_OF_ISSUANCE], "13th June 2025");
        assert_eq!(fields[COMPLETION_DATE], "3rd June 2025");
        assert!(!fields.contains_key(&unit_name_key(1)));
    }

    #[test]
    fn test_completion_date_falls_back_to_claim_date() {
        let mut ctx = context();
        ctx.claim.completed_at = None;
        let fields = transcript_fields(&ctx, "REG-00001", &units(1));
        assert_eq!(fields[COMPLETION_DATE], "11th June 2025");
    }

    #[test]
    fn test_transcript_fields_fill_unused_slots_with_empty() {
        let ctx = context();
        let fields = transcript_fields(&ctx, "REG-00001", &units(3));

        assert_eq!(fields["UNIT_1_NAME"], "Unit 1 title");
        assert_eq!(fields["UNIT_3_CREDITS"], "3");
        assert_eq!(fields["UNIT_4_NAME"], "");
        assert_eq!(fields["UNIT_25_CREDITS"], "");
        assert_eq!(fields[COURSE_LEVEL], "Level 2");
        assert_eq!(fields[TOTAL_CREDITS], "6");
    }

    #[test]
    fn test_transcript_fields_cap_at_max_units() {
        let ctx = context();
        let fields = transcript_fields(&ctx, "REG-00001", &units(30));

        let populated = (1..=MAX_TRANSCRIPT_UNITS)
            .filter(|slot| !fields[&unit_name_key(*slot)].is_empty())
            .count();
        assert_eq!(populated, MAX_TRANSCRIPT_UNITS);
        assert_eq!(fields["UNIT_25_NAME"], "Unit 25 title");
        assert!(!fields.contains_key("UNIT_26_NAME"));
    }
}
