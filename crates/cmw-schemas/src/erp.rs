//! ERP record payloads as they come off the OData wire.
//!
//! Field names mirror the upstream entity attributes verbatim; `clean_*`
//! normalization (zero UUIDs, `0001-01-01` sentinels) happens in
//! `cmw-mappers`, not here.

use serde::Deserialize;

/// One page of an OData collection response: `{"value": [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OdataPage<T> {
    #[serde(default)]
    pub value: Vec<T>,
}

// ---------------------------------------------------------------------------
// ConsultationDoc
// ---------------------------------------------------------------------------

/// A consultation document (`ConsultationDoc`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpConsultation {
    #[serde(rename = "Ref_Key")]
    pub ref_key: Option<String>,
    #[serde(rename = "Number")]
    pub number: Option<String>,
    #[serde(rename = "Client_Key")]
    pub client_key: Option<String>,
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "Author_Key")]
    pub author_key: Option<String>,
    #[serde(rename = "CreateDate")]
    pub create_date: Option<String>,
    #[serde(rename = "ConsultationDate")]
    pub consultation_date: Option<String>,
    #[serde(rename = "EndDate")]
    pub end_date: Option<String>,
    /// Drives the incremental cursor.
    #[serde(rename = "ChangeDate")]
    pub change_date: Option<String>,
    /// Category word: consultation / queue / other.
    #[serde(rename = "RequestKind")]
    pub request_kind: Option<String>,
    /// "Closed without consultation" flag; forces `cancelled`.
    #[serde(rename = "ClosedWithoutConsultation", default)]
    pub closed_without_consultation: bool,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "Question")]
    pub question: Option<String>,
    #[serde(rename = "QuestionCategory_Key")]
    pub question_category_key: Option<String>,
    #[serde(rename = "ConsultationQuestion_Key")]
    pub consultation_question_key: Option<String>,
    /// Consultation lines (typed Q&A with PO section / blocking keys).
    #[serde(rename = "ConsultationLines", default)]
    pub consultation_lines: Vec<ErpConsultationLine>,
    /// Plain question/answer lines; renumbered from 1000 on rebuild.
    #[serde(rename = "QuestionAnswers", default)]
    pub question_answers: Vec<ErpQuestionAnswer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpConsultationLine {
    #[serde(rename = "LineNumber")]
    pub line_number: Option<i64>,
    #[serde(rename = "PoType_Key")]
    pub po_type_key: Option<String>,
    #[serde(rename = "PoSection_Key")]
    pub po_section_key: Option<String>,
    #[serde(rename = "Blocking_Key")]
    pub blocking_key: Option<String>,
    #[serde(rename = "ManagerHelp_Key")]
    pub manager_help_key: Option<String>,
    #[serde(rename = "IsRepeat", default)]
    pub is_repeat: bool,
    #[serde(rename = "Question")]
    pub question: Option<String>,
    #[serde(rename = "Answer")]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpQuestionAnswer {
    #[serde(rename = "LineNumber")]
    pub line_number: Option<i64>,
    #[serde(rename = "Question")]
    pub question: Option<String>,
    #[serde(rename = "Answer")]
    pub answer: Option<String>,
}

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

/// Dial-attempt register row (`CallRegister`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpCall {
    #[serde(rename = "Period")]
    pub period: Option<String>,
    #[serde(rename = "ConsultationDoc_Key")]
    pub consultation_key: Option<String>,
    #[serde(rename = "Client_Key")]
    pub client_key: Option<String>,
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
}

/// Reschedule register row (`ReschedRegister`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpReschedule {
    #[serde(rename = "Period")]
    pub period: Option<String>,
    #[serde(rename = "ConsultationDoc_Key")]
    pub consultation_key: Option<String>,
    #[serde(rename = "Client_Key")]
    pub client_key: Option<String>,
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "OldDate")]
    pub old_date: Option<String>,
    #[serde(rename = "NewDate")]
    pub new_date: Option<String>,
}

/// Rating register row (`RatingRegister`). Ordered by `Consultation_Key`;
/// `RatingDate` is frequently unfilled, which is why the checkpoint for this
/// entity is key-based.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpRating {
    #[serde(rename = "Consultation_Key")]
    pub consultation_key: Option<String>,
    #[serde(rename = "Client_Key")]
    pub client_key: Option<String>,
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "QuestionNumber")]
    pub question_number: Option<i64>,
    #[serde(rename = "Rating")]
    pub rating: Option<i64>,
    #[serde(rename = "Question")]
    pub question_text: Option<String>,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
    #[serde(rename = "SentToBase", default)]
    pub sent_to_base: bool,
    #[serde(rename = "RatingDate")]
    pub rating_date: Option<String>,
}

/// Queue-closing register row (`QueueClosingRegister`). One row closes one
/// operator's queue for exactly one day.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpQueueClosing {
    #[serde(rename = "Date")]
    pub date: Option<String>,
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "Closed", default)]
    pub closed: bool,
}

// ---------------------------------------------------------------------------
// User catalog + satellites
// ---------------------------------------------------------------------------

/// Operator catalog row (`UserCatalog`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpUser {
    #[serde(rename = "Ref_Key")]
    pub ref_key: Option<String>,
    #[serde(rename = "Code")]
    pub code: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "DeletionMark", default)]
    pub deletion_mark: bool,
    #[serde(rename = "Invalid", default)]
    pub invalid: bool,
    #[serde(rename = "Service", default)]
    pub service: bool,
    #[serde(rename = "ContactInfo", default)]
    pub contact_info: Vec<ErpContactInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpContactInfo {
    #[serde(rename = "Type")]
    pub kind: Option<String>,
    #[serde(rename = "EmailAddress")]
    pub email_address: Option<String>,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: Option<String>,
}

impl ErpContactInfo {
    pub const KIND_EMAIL: &'static str = "EmailAddress";
    pub const KIND_PHONE: &'static str = "Phone";
}

/// Department catalog row (`DepartmentCatalog`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpDepartment {
    #[serde(rename = "Ref_Key")]
    pub ref_key: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "DeletionMark", default)]
    pub deletion_mark: bool,
}

/// User→department register row (`UserDepartmentRegister`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpUserDepartment {
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "Department_Key")]
    pub department_key: Option<String>,
}

/// User→language register row (`UserLanguageRegister`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpUserLanguage {
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "Language_Key")]
    pub language_key: Option<String>,
}

/// Consultant-list register row (`ConsultantListRegister`): limit and working
/// hours, most recent `Period` wins per operator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpConsultantEntry {
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "Period")]
    pub period: Option<String>,
    #[serde(rename = "ConsultationLimit")]
    pub consultation_limit: Option<String>,
    #[serde(rename = "WorkStart")]
    pub work_start: Option<String>,
    #[serde(rename = "WorkEnd")]
    pub work_end: Option<String>,
}

/// Skill register row (`UserCategoryRegister`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErpUserCategory {
    #[serde(rename = "Manager_Key")]
    pub manager_key: Option<String>,
    #[serde(rename = "QuestionCategory_Key")]
    pub question_category_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consultation_page_decodes_with_missing_optional_fields() {
        let raw = r#"{
            "value": [
                {
                    "Ref_Key": "15d38cda-1812-11ef-b824-c67597d01fa8",
                    "Number": "CL-001",
                    "RequestKind": "AccountingConsultation",
                    "ConsultationLines": [
                        {"LineNumber": 1, "Question": "q", "Answer": "a", "IsRepeat": true}
                    ]
                }
            ]
        }"#;

        let page: OdataPage<ErpConsultation> = serde_json::from_str(raw).unwrap();
        assert_eq!(page.value.len(), 1);
        let doc = &page.value[0];
        assert_eq!(doc.number.as_deref(), Some("CL-001"));
        assert!(!doc.closed_without_consultation);
        assert_eq!(doc.consultation_lines.len(), 1);
        assert!(doc.consultation_lines[0].is_repeat);
        assert!(doc.question_answers.is_empty());
    }

    #[test]
    fn empty_page_decodes() {
        let page: OdataPage<ErpRating> = serde_json::from_str("{}").unwrap();
        assert!(page.value.is_empty());
    }
}
