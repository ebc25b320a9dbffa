//! Turning raw scraped records into documents.
//!
//! LinkedIn records come from the profile processor as JSON objects;
//! Scholar records are the article/author exports of the Scholar scraper.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::{
    AuthorProfile, CareerLevel, Document, DocumentMetadata, EducationLevel, LinkedinProfile, Publication,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Experience {
    pub title: Option<String>,
    pub company: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Education {
    pub degree: Option<String>,
    pub field_of_study: Option<String>,
    pub school: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamedItem {
    #[serde(alias = "title")]
    pub name: Option<String>,
    pub description: Option<String>,
}

/// A processed LinkedIn profile.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkedinRecord {
    pub urn_id: Option<String>,
    pub full_name: Option<String>,
    pub headline: Option<String>,
    pub location_name: Option<String>,
    pub industry: Option<String>,
    pub summary: Option<String>,
    pub current_title: Option<String>,
    pub current_company: Option<String>,
    pub experiences: Vec<Experience>,
    pub educations: Vec<Education>,
    pub skills: Vec<String>,
    pub publications: Vec<NamedItem>,
    pub projects: Vec<NamedItem>,
    pub education_level: Option<String>,
    pub career_level: Option<String>,
    /// Numeric or a numeric string depending on the processor version
    pub total_years_experience: Value,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn number(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn integer(value: &Value) -> Option<i64> {
    number(value).map(|n| n as i64)
}

impl LinkedinRecord {
    /// Text that gets embedded for this profile.
    pub fn profile_text(&self) -> String {
        let mut sections = Vec::new();

        let mut basic = format!("Name: {}\n", present(&self.full_name).unwrap_or_default());
        if let Some(headline) = present(&self.headline) {
            basic.push_str(&format!("Headline: {headline}\n"));
        }
        basic.push_str(&format!(
            "Location: {}\n",
            present(&self.location_name).unwrap_or_default()
        ));
        if let Some(industry) = present(&self.industry) {
            basic.push_str(&format!("Industry: {industry}\n"));
        }
        sections.push(basic.trim_end().to_string());

        if let Some(summary) = present(&self.summary) {
            sections.push(format!("Summary: {summary}"));
        }

        if let Some(title) = present(&self.current_title) {
            let company = present(&self.current_company).unwrap_or_default();
            sections.push(format!("Current Position: {title} at {company}"));
        }

        if !self.experiences.is_empty() {
            let lines: Vec<String> = self
                .experiences
                .iter()
                .map(|exp| {
                    let mut line = format!(
                        "{} at {}",
                        present(&exp.title).unwrap_or_default(),
                        present(&exp.company).unwrap_or_default()
                    );
                    if let Some(description) = present(&exp.description) {
                        line.push_str(&format!(": {description}"));
                    }
                    line
                })
                .collect();
            sections.push(format!("Experience: {}", lines.join("\n")));
        }

        if !self.educations.is_empty() {
            let lines: Vec<String> = self
                .educations
                .iter()
                .map(|edu| {
                    format!(
                        "{} in {} from {}",
                        present(&edu.degree).unwrap_or_default(),
                        present(&edu.field_of_study).unwrap_or_default(),
                        present(&edu.school).unwrap_or_default()
                    )
                })
                .collect();
            sections.push(format!("Education: {}", lines.join("\n")));
        }

        if !self.skills.is_empty() {
            sections.push(format!("Skills: {}", self.skills.join(", ")));
        }

        for (label, items) in [("Publications", &self.publications), ("Projects", &self.projects)] {
            if items.is_empty() {
                continue;
            }
            let lines: Vec<String> = items
                .iter()
                .map(|item| match present(&item.description) {
                    Some(description) => format!("{}: {description}", present(&item.name).unwrap_or_default()),
                    None => present(&item.name).unwrap_or_default().to_string(),
                })
                .collect();
            sections.push(format!("{label}: {}", lines.join("\n")));
        }

        sections.join("\n\n")
    }

    fn education(&self) -> Option<EducationLevel> {
        if let Some(level) = present(&self.education_level) {
            return Some(EducationLevel::classify(level));
        }
        self.educations
            .iter()
            .filter_map(|e| present(&e.degree))
            .map(EducationLevel::classify)
            .max()
    }

    fn career(&self) -> Option<CareerLevel> {
        present(&self.career_level)
            .or_else(|| present(&self.current_title))
            .map(CareerLevel::classify)
    }

    /// The profile as a document, or `None` when it has no `urn_id`.
    pub fn into_document(self) -> Option<Document> {
        let Some(urn_id) = present(&self.urn_id).map(str::to_string) else {
            log::warn!(
                "skipping LinkedIn profile without urn_id ({})",
                present(&self.full_name).unwrap_or("unnamed")
            );
            return None;
        };

        let metadata = LinkedinProfile {
            urn_id: Some(urn_id.clone()),
            name: self.full_name.clone(),
            current_title: self.current_title.clone(),
            current_company: self.current_company.clone(),
            location: self.location_name.clone(),
            industry: self.industry.clone(),
            education_level: self.education(),
            career_level: self.career(),
            years_experience: number(&self.total_years_experience),
        };

        Some(Document::new(
            urn_id,
            self.profile_text(),
            Some(DocumentMetadata::LinkedinProfile(metadata)),
        ))
    }
}

/// One article row of a Scholar export.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScholarArticle {
    #[serde(rename = "Article ID")]
    pub article_id: Value,
    #[serde(rename = "Article Title")]
    pub title: Option<String>,
    #[serde(rename = "Article Snippet")]
    pub snippet: Option<String>,
    #[serde(rename = "Publication Summary")]
    pub publication_summary: Option<String>,
    #[serde(rename = "Publication Year")]
    pub year: Value,
    #[serde(rename = "Journal URL")]
    pub url: Option<String>,
    #[serde(rename = "Number of Citations")]
    pub citations: Value,
    #[serde(rename = "Scholar Profile (If available)")]
    pub scholar_profile: Option<String>,
}

/// One author row of a Scholar export, linked to its article by id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScholarAuthor {
    #[serde(rename = "Article ID")]
    pub article_id: Value,
    #[serde(rename = "Author Name")]
    pub name: Option<String>,
    #[serde(rename = "Affiliations")]
    pub affiliations: Option<String>,
    #[serde(rename = "Interests")]
    pub interests: Option<String>,
    #[serde(rename = "Website")]
    pub website: Option<String>,
}

/// A Scholar export file: the query it was scraped for plus its rows.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScholarExport {
    pub query: Option<String>,
    pub articles: Vec<ScholarArticle>,
    pub authors: Vec<ScholarAuthor>,
}

/// `{prefix}_{first 12 hex chars of sha256}` over the non-empty parts.
fn content_id(prefix: &str, parts: &[String]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("_");
    let digest = Sha256::digest(joined.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{}", &hex[..12])
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ScholarExport {
    /// One publication document per article, carrying its authors.
    pub fn publication_documents(&self) -> Vec<Document> {
        self.articles
            .iter()
            .filter(|article| present(&article.title).is_some())
            .map(|article| self.publication_document(article))
            .collect()
    }

    fn publication_document(&self, article: &ScholarArticle) -> Document {
        let authors: Vec<&ScholarAuthor> = self
            .authors
            .iter()
            .filter(|a| !a.article_id.is_null() && a.article_id == article.article_id)
            .collect();

        let id = content_id(
            "scholar",
            &[
                article.title.clone().unwrap_or_default(),
                value_text(&article.year),
                article.url.clone().unwrap_or_default(),
                article.scholar_profile.clone().unwrap_or_default(),
            ],
        );

        let author_text = if authors.is_empty() {
            "No author information available".to_string()
        } else {
            authors
                .iter()
                .map(|a| {
                    let mut lines = Vec::new();
                    if let Some(name) = present(&a.name) {
                        lines.push(format!("Name: {name}"));
                    }
                    if let Some(affiliations) = present(&a.affiliations) {
                        lines.push(format!("Affiliations: {affiliations}"));
                    }
                    if let Some(interests) = present(&a.interests) {
                        lines.push(format!("Research Interests: {interests}"));
                    }
                    if let Some(website) = present(&a.website) {
                        lines.push(format!("Website: {website}"));
                    }
                    lines.join("\n")
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let content = format!(
            "Title: {}\nAbstract: {}\nPublication Info: {}\n\nAuthors:\n{}",
            present(&article.title).unwrap_or_default(),
            present(&article.snippet).unwrap_or_default(),
            present(&article.publication_summary).unwrap_or_default(),
            author_text
        );

        let names: Vec<&str> = authors.iter().filter_map(|a| present(&a.name)).collect();
        let metadata = Publication {
            title: article.title.clone(),
            author: names.first().map(|n| n.to_string()),
            authors: (!names.is_empty()).then(|| names.join(", ")),
            year: integer(&article.year),
            citations: integer(&article.citations),
            url: article.url.clone(),
            query: self.query.clone(),
        };

        Document::new(id, content, Some(DocumentMetadata::Publication(metadata)))
    }

    /// One author document per distinct author name, listing their
    /// publications in this export.
    pub fn author_documents(&self) -> Vec<Document> {
        let mut seen: Vec<&str> = Vec::new();
        let mut documents = Vec::new();

        for author in &self.authors {
            let Some(name) = present(&author.name) else {
                continue;
            };
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);

            let rows: Vec<&ScholarAuthor> = self
                .authors
                .iter()
                .filter(|a| present(&a.name) == Some(name))
                .collect();
            let titles: Vec<&str> = self
                .articles
                .iter()
                .filter(|article| rows.iter().any(|r| !r.article_id.is_null() && r.article_id == article.article_id))
                .filter_map(|article| present(&article.title))
                .collect();
            let citations: i64 = self
                .articles
                .iter()
                .filter(|article| rows.iter().any(|r| !r.article_id.is_null() && r.article_id == article.article_id))
                .filter_map(|article| integer(&article.citations))
                .sum();

            let affiliations = present(&author.affiliations).unwrap_or_default();
            let interests = present(&author.interests).unwrap_or_default();
            let content = format!(
                "{name}. {affiliations}. Interests: {interests}. Publications: {}",
                titles.join(", ")
            );

            let metadata = AuthorProfile {
                name: Some(name.to_string()),
                affiliations: author.affiliations.clone(),
                interests: author.interests.clone(),
                citations: Some(citations),
                num_articles: Some(titles.len() as i64),
                website: author.website.clone(),
                ..Default::default()
            };

            documents.push(Document::new(
                content_id("author", &[name.to_string()]),
                content,
                Some(DocumentMetadata::AuthorProfile(metadata)),
            ));
        }

        documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linkedin() -> LinkedinRecord {
        serde_json::from_value(serde_json::json!({
            "urn_id": "ACoAA123",
            "full_name": "Ada Lovelace",
            "headline": "Computing pioneer",
            "location_name": "London",
            "industry": "Research",
            "current_title": "Chief Scientist",
            "current_company": "Analytical Engines",
            "experiences": [{"title": "Analyst", "company": "Babbage & Co", "description": "Notes on the engine"}],
            "educations": [{"degree": "PhD", "field_of_study": "Mathematics", "school": "London"}],
            "skills": ["math", "poetry"],
            "total_years_experience": "12"
        }))
        .unwrap()
    }

    #[test]
    fn test_linkedin_profile_text_sections() {
        let text = linkedin().profile_text();
        assert!(text.starts_with("Name: Ada Lovelace\nHeadline: Computing pioneer\nLocation: London\nIndustry: Research"));
        assert!(text.contains("\n\nCurrent Position: Chief Scientist at Analytical Engines"));
        assert!(text.contains("\n\nExperience: Analyst at Babbage & Co: Notes on the engine"));
        assert!(text.contains("\n\nEducation: PhD in Mathematics from London"));
        assert!(text.ends_with("Skills: math, poetry"));
    }

    #[test]
    fn test_linkedin_metadata_is_classified() {
        let doc = linkedin().into_document().unwrap();
        assert_eq!(doc.id, "ACoAA123");
        let Some(DocumentMetadata::LinkedinProfile(meta)) = doc.metadata else {
            panic!("expected a linkedin profile");
        };
        assert_eq!(meta.years_experience, Some(12.0));
        assert_eq!(meta.education_level, Some(EducationLevel::Phd));
        assert_eq!(meta.career_level, Some(CareerLevel::Executive));
    }

    #[test]
    fn test_linkedin_without_urn_is_skipped() {
        let record = LinkedinRecord {
            full_name: Some("No Id".into()),
            ..Default::default()
        };
        assert!(record.into_document().is_none());
    }

    fn scholar() -> ScholarExport {
        serde_json::from_value(serde_json::json!({
            "query": "protein folding",
            "articles": [
                {"Article ID": 1, "Article Title": "Folding at home", "Publication Year": "2019",
                 "Number of Citations": 40, "Journal URL": "https://example.org/a"},
                {"Article ID": 2, "Article Title": "Misfolding", "Publication Year": 2021,
                 "Number of Citations": "2"}
            ],
            "authors": [
                {"Article ID": 1, "Author Name": "R. Franklin", "Affiliations": "King's College",
                 "Interests": "crystallography"},
                {"Article ID": 2, "Author Name": "R. Franklin", "Affiliations": "King's College",
                 "Interests": "crystallography"},
                {"Article ID": 2, "Author Name": "M. Wilkins"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_scholar_publications() {
        let export = scholar();
        let docs = export.publication_documents();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].id.starts_with("scholar_"));
        assert_eq!(docs[0].id.len(), "scholar_".len() + 12);
        assert!(docs[0].content.contains("Name: R. Franklin\nAffiliations: King's College"));

        let Some(DocumentMetadata::Publication(meta)) = &docs[1].metadata else {
            panic!("expected a publication");
        };
        assert_eq!(meta.year, Some(2021));
        assert_eq!(meta.citations, Some(2));
        assert_eq!(meta.authors.as_deref(), Some("R. Franklin, M. Wilkins"));
        assert_eq!(meta.query.as_deref(), Some("protein folding"));

        // ids are stable across runs
        assert_eq!(export.publication_documents()[0].id, docs[0].id);
    }

    #[test]
    fn test_scholar_authors() {
        let docs = scholar().author_documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].content,
            "R. Franklin. King's College. Interests: crystallography. Publications: Folding at home, Misfolding"
        );
        let Some(DocumentMetadata::AuthorProfile(meta)) = &docs[0].metadata else {
            panic!("expected an author profile");
        };
        assert_eq!(meta.citations, Some(42));
        assert_eq!(meta.num_articles, Some(2));
    }
}
