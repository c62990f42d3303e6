//! Core domain model for job harvesting: identifiers, records and the flattened master row.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobharvest-core";

/// Separator used when list-valued fields are stored as a single cell.
pub const LIST_DELIMITER: &str = "; ";

pub const DEFAULT_LINK_TEMPLATE: &str = "https://jobs.bdjobs.com/jobdetails.asp?id={id}";

/// Identifier as a source produced it, before canonicalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl RawId {
    pub fn canonical(&self) -> CanonicalId {
        let text = match self {
            RawId::Integer(v) => v.to_string(),
            RawId::Float(v) => canonical_float(*v),
            RawId::Text(v) => canonical_text(v),
            RawId::Bool(v) => v.to_string(),
        };
        CanonicalId(text)
    }
}

fn canonical_float(value: f64) -> String {
    // Integral floats come from spreadsheets and JSON numbers; render them like integers.
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Trimmed text, with decimal renderings of whole numbers (`"1001.0"`) folded to integer form.
fn canonical_text(value: &str) -> String {
    let trimmed = value.trim();
    let decimal = trimmed.contains('.')
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    match trimmed.parse::<f64>() {
        Ok(number) if decimal && number.is_finite() && number.fract() == 0.0 => {
            canonical_float(number)
        }
        _ => trimmed.to_string(),
    }
}

/// Identifier in its single comparable string form.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Canonicalises stored text the same way a textual [`RawId`] would be.
    pub fn from_text(text: &str) -> Self {
        RawId::Text(text.to_string()).canonical()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One job posting snapshot as returned by the detail API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: CanonicalId,
    pub title: Option<String>,
    pub company: Option<String>,
    pub posted_on: Option<String>,
    pub deadline: Option<String>,
    pub vacancies: Option<String>,
    pub nature: Option<String>,
    pub workplace: Option<String>,
    pub education_requirements: Vec<String>,
    pub experience: Vec<String>,
    pub additional_requirements: Vec<String>,
    pub skills_required: Vec<String>,
    pub description: Vec<String>,
    pub location: Option<String>,
    pub salary_range: Option<String>,
    pub company_address: Option<String>,
    pub apply_email: Option<String>,
    pub apply_instruction: Option<String>,
}

impl JobRecord {
    pub fn new(id: CanonicalId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn link(&self, link_template: &str) -> String {
        render_link(link_template, &self.id)
    }

    /// Flattens list fields with [`LIST_DELIMITER`] for storage.
    pub fn to_master_row(&self, link_template: &str) -> MasterRow {
        MasterRow {
            job_id: Some(self.id.as_str().to_string()),
            job_title: self.title.clone(),
            company_name: self.company.clone(),
            posted_on: self.posted_on.clone(),
            deadline: self.deadline.clone(),
            vacancies: self.vacancies.clone(),
            job_nature: self.nature.clone(),
            workplace: self.workplace.clone(),
            education_requirements: join_fragments(&self.education_requirements),
            experience: join_fragments(&self.experience),
            additional_requirements: join_fragments(&self.additional_requirements),
            skills_required: join_fragments(&self.skills_required),
            job_description: join_fragments(&self.description),
            location: self.location.clone(),
            salary_range: self.salary_range.clone(),
            company_address: self.company_address.clone(),
            apply_email: self.apply_email.clone(),
            apply_instruction: self.apply_instruction.clone(),
            job_link: Some(self.link(link_template)),
            extra: Vec::new(),
        }
    }
}

pub fn render_link(link_template: &str, id: &CanonicalId) -> String {
    link_template.replace("{id}", id.as_str())
}

pub fn join_fragments(fragments: &[String]) -> Option<String> {
    if fragments.is_empty() {
        None
    } else {
        Some(fragments.join(LIST_DELIMITER))
    }
}

/// Flattened storage row of the master dataset. Column names are the persisted header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasterRow {
    #[serde(rename = "Job ID")]
    pub job_id: Option<String>,
    #[serde(rename = "Job Title")]
    pub job_title: Option<String>,
    #[serde(rename = "Company Name")]
    pub company_name: Option<String>,
    #[serde(rename = "Posted On")]
    pub posted_on: Option<String>,
    #[serde(rename = "Deadline")]
    pub deadline: Option<String>,
    #[serde(rename = "Vacancies")]
    pub vacancies: Option<String>,
    #[serde(rename = "Job Nature")]
    pub job_nature: Option<String>,
    #[serde(rename = "Workplace")]
    pub workplace: Option<String>,
    #[serde(rename = "Education Requirements")]
    pub education_requirements: Option<String>,
    #[serde(rename = "Experience")]
    pub experience: Option<String>,
    #[serde(rename = "Additional Requirements")]
    pub additional_requirements: Option<String>,
    #[serde(rename = "Skills Required")]
    pub skills_required: Option<String>,
    #[serde(rename = "Job Description")]
    pub job_description: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Salary Range")]
    pub salary_range: Option<String>,
    #[serde(rename = "Company Address")]
    pub company_address: Option<String>,
    #[serde(rename = "Apply Email")]
    pub apply_email: Option<String>,
    #[serde(rename = "Apply Instruction")]
    pub apply_instruction: Option<String>,
    #[serde(rename = "Job Link")]
    pub job_link: Option<String>,
    /// Cells under columns outside [`MasterRow::COLUMNS`], as `(header, value)` in file order.
    #[serde(skip)]
    pub extra: Vec<(String, String)>,
}

impl MasterRow {
    pub const ID_COLUMN: &'static str = "Job ID";

    pub const COLUMNS: [&'static str; 19] = [
        "Job ID",
        "Job Title",
        "Company Name",
        "Posted On",
        "Deadline",
        "Vacancies",
        "Job Nature",
        "Workplace",
        "Education Requirements",
        "Experience",
        "Additional Requirements",
        "Skills Required",
        "Job Description",
        "Location",
        "Salary Range",
        "Company Address",
        "Apply Email",
        "Apply Instruction",
        "Job Link",
    ];

    /// Fixed-column cells in [`MasterRow::COLUMNS`] order.
    pub fn cells(&self) -> [Option<&str>; 19] {
        [
            self.job_id.as_deref(),
            self.job_title.as_deref(),
            self.company_name.as_deref(),
            self.posted_on.as_deref(),
            self.deadline.as_deref(),
            self.vacancies.as_deref(),
            self.job_nature.as_deref(),
            self.workplace.as_deref(),
            self.education_requirements.as_deref(),
            self.experience.as_deref(),
            self.additional_requirements.as_deref(),
            self.skills_required.as_deref(),
            self.job_description.as_deref(),
            self.location.as_deref(),
            self.salary_range.as_deref(),
            self.company_address.as_deref(),
            self.apply_email.as_deref(),
            self.apply_instruction.as_deref(),
            self.job_link.as_deref(),
        ]
    }

    pub fn extra_value(&self, column: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(header, _)| header == column)
            .map(|(_, value)| value.as_str())
    }

    /// Canonical id of the row, or `None` when the id cell is blank.
    pub fn canonical_id(&self) -> Option<CanonicalId> {
        self.job_id
            .as_deref()
            .map(CanonicalId::from_text)
            .filter(|id| !id.is_empty())
    }
}

/// Full persisted table of rows, in file order.
pub type MasterDataset = Vec<MasterRow>;
