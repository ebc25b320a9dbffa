//! Documents, their typed metadata and metadata filters.
//!
//! Metadata is a closed schema tagged by `doc_type`. Each variant carries a
//! small set of optional typed fields. For filtering and display the
//! metadata is flattened into an ordered map of scalar values, so
//! `{"doc_type": "author", "name": "Ada"}` is both what callers send and
//! what filters match against.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EducationLevel {
    Other,
    Bachelor,
    Master,
    Phd,
}

impl EducationLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            EducationLevel::Phd => 3,
            EducationLevel::Master => 2,
            EducationLevel::Bachelor => 1,
            EducationLevel::Other => 0,
        }
    }

    /// Classify a free-text degree ("PhD in Physics", "MSc", "Doctor of ...").
    pub fn classify(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.contains("phd") || text.contains("ph.d") || text.contains("doctor") {
            EducationLevel::Phd
        } else if text.contains("master") || text.contains("msc") || text.contains("mba") {
            EducationLevel::Master
        } else if text.contains("bachelor") || text.contains("bsc") || text.contains("b.s") {
            EducationLevel::Bachelor
        } else {
            EducationLevel::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CareerLevel {
    Other,
    Senior,
    Manager,
    Director,
    Executive,
}

impl CareerLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            CareerLevel::Executive => 4,
            CareerLevel::Director => 3,
            CareerLevel::Manager => 2,
            CareerLevel::Senior => 1,
            CareerLevel::Other => 0,
        }
    }

    /// Classify a job title by whole words, so "Director" is not read as
    /// "cto" nor "Vice President" as "president".
    pub fn classify(title: &str) -> Self {
        let title = title.to_lowercase();
        let words: Vec<&str> = title
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |wanted: &[&str]| words.iter().any(|w| wanted.contains(w));
        let phrase = |first: &str, second: &str| words.windows(2).any(|w| w[0] == first && w[1] == second);

        if phrase("vice", "president") || phrase("head", "of") || has(&["director", "vp", "svp", "evp"]) {
            CareerLevel::Director
        } else if has(&["executive", "chief", "ceo", "cto", "cfo", "coo", "founder", "cofounder", "president", "partner"]) {
            CareerLevel::Executive
        } else if has(&["manager", "lead"]) {
            CareerLevel::Manager
        } else if has(&["senior", "sr", "principal", "staff"]) {
            CareerLevel::Senior
        } else {
            CareerLevel::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_articles: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years_experience: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub education_level: Option<EducationLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub career_level: Option<CareerLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Publication {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedinProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub education_level: Option<EducationLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub career_level: Option<CareerLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years_experience: Option<f64>,
}

/// Metadata schema, one variant per document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "doc_type", rename_all = "snake_case")]
pub enum DocumentMetadata {
    #[serde(rename = "author")]
    AuthorProfile(AuthorProfile),
    Publication(Publication),
    LinkedinProfile(LinkedinProfile),
}

impl DocumentMetadata {
    pub fn doc_type(&self) -> &'static str {
        match self {
            DocumentMetadata::AuthorProfile(_) => "author",
            DocumentMetadata::Publication(_) => "publication",
            DocumentMetadata::LinkedinProfile(_) => "linkedin_profile",
        }
    }

    /// Flatten into scalar fields, `doc_type` included.
    pub fn fields(&self) -> BTreeMap<String, MetadataValue> {
        let mut fields = BTreeMap::new();
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in map {
                if let Some(value) = MetadataValue::from_json(&value) {
                    fields.insert(key, value);
                }
            }
        }
        fields
    }
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetadataValue::Int)
                .or_else(|| n.as_f64().map(MetadataValue::Float)),
            serde_json::Value::String(s) => Some(MetadataValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Numeric view. Numeric strings count, since raw records often carry
    /// numbers as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::Text(s) => s.trim().parse().ok(),
            MetadataValue::Bool(_) => None,
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn matches(&self, other: &MetadataValue) -> bool {
        match (self, other) {
            (MetadataValue::Text(a), MetadataValue::Text(b)) => a == b,
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => a == b,
            (MetadataValue::Int(a), MetadataValue::Int(b)) => a == b,
            _ => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Int(i) => write!(f, "{i}"),
            MetadataValue::Float(x) => write!(f, "{x}"),
            MetadataValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>, metadata: Option<DocumentMetadata>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }

    pub fn fields(&self) -> BTreeMap<String, MetadataValue> {
        self.metadata.as_ref().map(|m| m.fields()).unwrap_or_default()
    }
}

/// Zip parallel `ids` / `contents` / `metadatas` into documents, rejecting
/// malformed input before anything leaves the process.
pub fn assemble(
    ids: Vec<String>,
    contents: Vec<String>,
    metadatas: Option<Vec<DocumentMetadata>>,
) -> Result<Vec<Document>, StoreError> {
    if ids.is_empty() {
        return Err(StoreError::validation("ids must not be empty"));
    }
    if ids.len() != contents.len() {
        return Err(StoreError::validation(format!(
            "got {} ids but {} documents",
            ids.len(),
            contents.len()
        )));
    }
    if let Some(metadatas) = &metadatas {
        if metadatas.len() != ids.len() {
            return Err(StoreError::validation(format!(
                "got {} ids but {} metadatas",
                ids.len(),
                metadatas.len()
            )));
        }
    }

    let metadatas: Vec<Option<DocumentMetadata>> = match metadatas {
        Some(m) => m.into_iter().map(Some).collect(),
        None => vec![None; ids.len()],
    };

    let documents: Vec<Document> = ids
        .into_iter()
        .zip(contents)
        .zip(metadatas)
        .map(|((id, content), metadata)| Document { id, content, metadata })
        .collect();

    validate(&documents)?;
    Ok(documents)
}

pub fn validate(documents: &[Document]) -> Result<(), StoreError> {
    if documents.is_empty() {
        return Err(StoreError::validation("ids must not be empty"));
    }
    for (pos, doc) in documents.iter().enumerate() {
        if doc.id.trim().is_empty() {
            return Err(StoreError::validation(format!("id at position {pos} is empty")));
        }
        if doc.id.contains('\0') {
            return Err(StoreError::validation(format!("id at position {pos} contains a null byte")));
        }
        if doc.content.contains('\0') {
            return Err(StoreError::validation(format!(
                "document {:?} contains a null byte",
                doc.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterClause {
    Eq { field: String, value: MetadataValue },
    In { field: String, values: Vec<MetadataValue> },
    Gte { field: String, value: f64 },
    Lte { field: String, value: f64 },
    Gt { field: String, value: f64 },
    Lt { field: String, value: f64 },
}

impl FilterClause {
    fn matches(&self, fields: &BTreeMap<String, MetadataValue>) -> bool {
        let numeric = |field: &str| fields.get(field).and_then(MetadataValue::as_f64);
        match self {
            FilterClause::Eq { field, value } => fields.get(field).is_some_and(|v| v.matches(value)),
            FilterClause::In { field, values } => fields
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| v.matches(candidate))),
            FilterClause::Gte { field, value } => numeric(field).is_some_and(|v| v >= *value),
            FilterClause::Lte { field, value } => numeric(field).is_some_and(|v| v <= *value),
            FilterClause::Gt { field, value } => numeric(field).is_some_and(|v| v > *value),
            FilterClause::Lt { field, value } => numeric(field).is_some_and(|v| v < *value),
        }
    }
}

/// Conjunction of clauses. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub clauses: Vec<FilterClause>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<MetadataValue>) -> Self {
        self.clauses.push(FilterClause::Eq {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn any_of(mut self, field: &str, values: Vec<MetadataValue>) -> Self {
        self.clauses.push(FilterClause::In {
            field: field.to_string(),
            values,
        });
        self
    }

    pub fn gte(mut self, field: &str, value: f64) -> Self {
        self.clauses.push(FilterClause::Gte {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, fields: &BTreeMap<String, MetadataValue>) -> bool {
        self.clauses.iter().all(|clause| clause.matches(fields))
    }

    /// Parse the compact JSON form used by the HTTP and CLI layers:
    ///
    /// `{"location": "Paris", "industry": ["Biotech", "Pharma"], "years_experience": {"$gte": 5}}`
    ///
    /// A scalar is equality, a list is "any of", and an object holds
    /// `$eq`/`$in`/`$gte`/`$lte`/`$gt`/`$lt` operators.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, StoreError> {
        let map = match value {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(StoreError::validation(format!(
                    "filter must be an object, got {other}"
                )))
            }
        };

        let mut filter = Self::default();
        for (field, spec) in map {
            match spec {
                serde_json::Value::Array(items) => {
                    let values = items
                        .iter()
                        .map(|v| scalar(field, v))
                        .collect::<Result<Vec<_>, _>>()?;
                    filter.clauses.push(FilterClause::In {
                        field: field.clone(),
                        values,
                    });
                }
                serde_json::Value::Object(ops) => {
                    for (op, operand) in ops {
                        filter.clauses.push(operator_clause(field, op, operand)?);
                    }
                }
                other => filter.clauses.push(FilterClause::Eq {
                    field: field.clone(),
                    value: scalar(field, other)?,
                }),
            }
        }
        Ok(filter)
    }
}

fn scalar(field: &str, value: &serde_json::Value) -> Result<MetadataValue, StoreError> {
    MetadataValue::from_json(value).ok_or_else(|| {
        StoreError::validation(format!("filter on {field:?} needs scalar values, got {value}"))
    })
}

fn operator_clause(field: &str, op: &str, operand: &serde_json::Value) -> Result<FilterClause, StoreError> {
    let number = || {
        scalar(field, operand)?.as_f64().ok_or_else(|| {
            StoreError::validation(format!("{op} on {field:?} needs a number, got {operand}"))
        })
    };
    let field = field.to_string();
    let clause = match op {
        "$eq" => FilterClause::Eq {
            value: scalar(&field, operand)?,
            field,
        },
        "$in" => {
            let items = operand.as_array().ok_or_else(|| {
                StoreError::validation(format!("$in on {field:?} needs a list"))
            })?;
            FilterClause::In {
                values: items
                    .iter()
                    .map(|v| scalar(&field, v))
                    .collect::<Result<Vec<_>, _>>()?,
                field,
            }
        }
        "$gte" => FilterClause::Gte { value: number()?, field },
        "$lte" => FilterClause::Lte { value: number()?, field },
        "$gt" => FilterClause::Gt { value: number()?, field },
        "$lt" => FilterClause::Lt { value: number()?, field },
        other => {
            return Err(StoreError::validation(format!(
                "unsupported filter operator {other:?} on {field:?}"
            )))
        }
    };
    Ok(clause)
}
