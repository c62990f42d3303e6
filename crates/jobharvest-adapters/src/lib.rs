//! Listing/detail source contracts, the detail record normalizer, and board + fixture adapters.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jobharvest_core::{CanonicalId, JobRecord, RawId};
use jobharvest_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobharvest-adapters";

pub const DEFAULT_LISTING_URL_TEMPLATE: &str =
    "https://jobs.bdjobs.com/jobsearch.asp?pg={page}&rpp={page_size}";
pub const DEFAULT_DETAIL_URL_TEMPLATE: &str =
    "https://gateway.bdjobs.com/ActtivejobsTest/api/JobSubsystem/jobDetails?jobId={id}";

/// Hidden input on the search page whose value lists the page's job ids.
pub const ID_LIST_SELECTOR: &str = "input#arrTempJobIds";

/// Envelope status code the detail API uses for success.
pub const API_SUCCESS_STATUS: &str = "0";

#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("listing page has no id list element")]
    MissingIdList,
    #[error("malformed id list: {0}")]
    MalformedIdList(String),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single listing's details could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("api status code {0}")]
    ApiStatus(String),
    #[error("response has no data")]
    MissingData,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("record has no identifier")]
    MissingId,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Raw ids on one search page; may be empty.
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<RawId>, ListingError>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_detail(&self, id: &CanonicalId) -> Result<JobRecord, Unavailable>;
}

/// Parses a list literal such as `[123, '456', "789"]`.
///
/// Only numbers and quoted strings are accepted; anything else is rejected rather than evaluated.
pub fn parse_id_list(text: &str) -> Result<Vec<RawId>, ListingError> {
    let mut chars = text.trim().chars().peekable();
    let malformed = |reason: &str| ListingError::MalformedIdList(reason.to_string());

    if chars.next() != Some('[') {
        return Err(malformed("expected `[`"));
    }

    let mut ids = Vec::new();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.peek().copied() {
            Some(']') => {
                chars.next();
                break;
            }
            Some(quote @ ('\'' | '"')) => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(malformed("unterminated escape")),
                        },
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return Err(malformed("unterminated string")),
                    }
                }
                ids.push(RawId::Text(value));
            }
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(c) = chars.next_if(|c| *c == '-' || *c == '.' || c.is_ascii_digit()) {
                    literal.push(c);
                }
                ids.push(parse_number_literal(&literal).ok_or_else(|| {
                    ListingError::MalformedIdList(format!("bad number `{literal}`"))
                })?);
            }
            Some(other) => {
                return Err(ListingError::MalformedIdList(format!(
                    "unexpected character `{other}`"
                )))
            }
            None => return Err(malformed("unterminated list")),
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            Some(',') => continue,
            Some(']') => break,
            Some(other) => {
                return Err(ListingError::MalformedIdList(format!(
                    "expected `,` or `]`, found `{other}`"
                )))
            }
            None => return Err(malformed("unterminated list")),
        }
    }

    if chars.any(|c| !c.is_whitespace()) {
        return Err(malformed("trailing characters after list"));
    }
    Ok(ids)
}

fn parse_number_literal(literal: &str) -> Option<RawId> {
    if literal.contains('.') {
        literal.parse::<f64>().ok().map(RawId::Float)
    } else {
        literal.parse::<i64>().ok().map(RawId::Integer)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ListingError> {
    Selector::parse(selector).map_err(|e| ListingError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Reads the id list embedded in a search result page.
pub fn extract_id_list(html: &str) -> Result<Vec<RawId>, ListingError> {
    let document = Html::parse_document(html);
    let selector = parse_selector(ID_LIST_SELECTOR)?;
    let value = document
        .select(&selector)
        .next()
        .and_then(|n| n.value().attr("value"))
        .ok_or(ListingError::MissingIdList)?;
    parse_id_list(value)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Flattens markup into ordered text fragments: one per `<li>`/`<p>`, else the whole text.
pub fn html_fragments(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Vec::new();
    };
    let fragment = Html::parse_fragment(raw);
    let items = match Selector::parse("li, p") {
        Ok(selector) => fragment
            .select(&selector)
            .filter_map(|n| text_or_none(n.text().collect::<String>()))
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    if !items.is_empty() {
        return items;
    }
    strip_html(Some(raw)).into_iter().collect()
}

pub fn strip_html(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let fragment = Html::parse_fragment(raw);
    text_or_none(fragment.root_element().text().collect::<String>())
}

/// Splits a comma-delimited skills string into trimmed, non-empty entries.
pub fn split_skills(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn json_raw_id(value: &JsonValue) -> Option<RawId> {
    match value {
        JsonValue::String(s) => Some(RawId::Text(s.clone())),
        JsonValue::Number(n) => n
            .as_i64()
            .map(RawId::Integer)
            .or_else(|| n.as_f64().map(RawId::Float)),
        JsonValue::Bool(b) => Some(RawId::Bool(*b)),
        _ => None,
    }
}

/// Scalar JSON value as text; numbers are rendered, blanks and non-scalars are `None`.
fn scalar_text(value: &JsonValue) -> Option<String> {
    json_raw_id(value)
        .map(|raw| raw.canonical().into_inner())
        .filter(|s| !s.is_empty())
}

fn json_field<'a>(job: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    job.get(key).filter(|v| !v.is_null())
}

fn json_text(job: &JsonValue, key: &str) -> Option<String> {
    json_field(job, key).and_then(scalar_text)
}

fn json_markup<'a>(job: &'a JsonValue, key: &str) -> Option<&'a str> {
    json_field(job, key).and_then(JsonValue::as_str)
}

/// Detail API response as received, before normalisation.
#[derive(Debug, Clone)]
pub struct RawDetailPayload {
    pub requested_id: CanonicalId,
    pub http_status: u16,
    pub body: Vec<u8>,
}

/// Turns one detail API response into a [`JobRecord`].
pub fn normalize_detail(payload: &RawDetailPayload) -> Result<JobRecord, Unavailable> {
    if payload.http_status != 200 {
        return Err(Unavailable::HttpStatus(payload.http_status));
    }
    let envelope: JsonValue = serde_json::from_slice(&payload.body)
        .map_err(|e| Unavailable::Malformed(e.to_string()))?;
    if !envelope.is_object() {
        return Err(Unavailable::Malformed("envelope is not an object".to_string()));
    }

    let status = envelope.get("statuscode").and_then(scalar_text);
    if status.as_deref() != Some(API_SUCCESS_STATUS) {
        return Err(Unavailable::ApiStatus(
            status.unwrap_or_else(|| "missing".to_string()),
        ));
    }

    let job = envelope
        .get("data")
        .and_then(JsonValue::as_array)
        .and_then(|data| data.first())
        .filter(|job| job.is_object())
        .ok_or(Unavailable::MissingData)?;

    let id = json_field(job, "JobId")
        .and_then(json_raw_id)
        .map(|raw| raw.canonical())
        .filter(|id| !id.is_empty())
        .or_else(|| Some(payload.requested_id.clone()).filter(|id| !id.is_empty()))
        .ok_or(Unavailable::MissingId)?;
    if id != payload.requested_id {
        warn!(
            requested = %payload.requested_id,
            returned = %id,
            "detail id differs from request; record stored under the returned id"
        );
    }

    Ok(JobRecord {
        id,
        title: json_text(job, "JobTitle"),
        company: json_text(job, "CompnayName"),
        posted_on: json_text(job, "PostedOn"),
        deadline: json_text(job, "Deadline"),
        vacancies: json_text(job, "JobVacancies"),
        nature: json_text(job, "JobNature"),
        workplace: json_text(job, "JobWorkPlace"),
        education_requirements: html_fragments(json_markup(job, "EducationRequirements")),
        experience: html_fragments(json_markup(job, "experience")),
        additional_requirements: html_fragments(json_markup(job, "AdditionJobRequirements")),
        skills_required: split_skills(json_markup(job, "SkillsRequired")),
        description: html_fragments(json_markup(job, "JobDescription")),
        location: json_text(job, "JobLocation"),
        salary_range: json_text(job, "JobSalaryRange"),
        company_address: json_text(job, "CompanyAddress"),
        apply_email: json_text(job, "ApplyEmail"),
        apply_instruction: strip_html(json_markup(job, "ApplyInstruction")),
    })
}

fn render_listing_url(template: &str, page: u32, page_size: u32) -> String {
    template
        .replace("{page}", &page.to_string())
        .replace("{page_size}", &page_size.to_string())
}

fn render_detail_url(template: &str, id: &CanonicalId) -> String {
    template.replace("{id}", id.as_str())
}

/// Search pages fetched over HTTP; ids are read from the embedded hidden input.
#[derive(Debug, Clone)]
pub struct BoardListingSource {
    http: HttpFetcher,
    url_template: String,
}

impl BoardListingSource {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl ListingSource for BoardListingSource {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<RawId>, ListingError> {
        let url = render_listing_url(&self.url_template, page, page_size);
        let resp = self.http.fetch_bytes(&url).await?;
        extract_id_list(&String::from_utf8_lossy(&resp.body))
    }
}

#[derive(Debug, Clone)]
pub struct BoardDetailSource {
    http: HttpFetcher,
    url_template: String,
}

impl BoardDetailSource {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl DetailSource for BoardDetailSource {
    async fn fetch_detail(&self, id: &CanonicalId) -> Result<JobRecord, Unavailable> {
        let url = render_detail_url(&self.url_template, id);
        match self.http.fetch_bytes(&url).await {
            Ok(resp) => normalize_detail(&RawDetailPayload {
                requested_id: id.clone(),
                http_status: resp.status.as_u16(),
                body: resp.body,
            }),
            Err(FetchError::HttpStatus { status, .. }) => Err(Unavailable::HttpStatus(status)),
            Err(FetchError::Request(err)) => Err(Unavailable::Transport(err.to_string())),
        }
    }
}

/// Listing pages captured to disk as `listing/page-<n>.html`.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    root: PathBuf,
}

impl FixtureListingSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.root.join("listing").join(format!("page-{page}.html"))
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    async fn fetch_page(&self, page: u32, _page_size: u32) -> Result<Vec<RawId>, ListingError> {
        let path = self.page_path(page);
        let html = read_fixture(&path).map_err(|source| ListingError::Fixture { path, source })?;
        extract_id_list(&html)
    }
}

/// Detail responses captured to disk as `details/<id>.json`.
#[derive(Debug, Clone)]
pub struct FixtureDetailSource {
    root: PathBuf,
}

impl FixtureDetailSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn detail_path(&self, id: &CanonicalId) -> PathBuf {
        self.root.join("details").join(format!("{id}.json"))
    }
}

#[async_trait]
impl DetailSource for FixtureDetailSource {
    async fn fetch_detail(&self, id: &CanonicalId) -> Result<JobRecord, Unavailable> {
        let path = self.detail_path(id);
        let body = fs::read(&path)
            .map_err(|e| Unavailable::Transport(format!("{}: {e}", path.display())))?;
        normalize_detail(&RawDetailPayload {
            requested_id: id.clone(),
            http_status: 200,
            body,
        })
    }
}

fn read_fixture(path: &Path) -> std::io::Result<String> {
    fs::read_to_string(path)
}
