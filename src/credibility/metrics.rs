use serde::{Deserialize, Serialize};

use crate::config::CredibilityWeights;
use crate::document::{DocumentMetadata, EducationLevel};

/// The raw signals a credibility score is built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityMetrics {
    pub years_experience: f64,
    pub education_level_ordinal: u8,
    pub seniority_ordinal: u8,
}

impl EntityMetrics {
    pub fn new(years_experience: f64, education_level_ordinal: u8, seniority_ordinal: u8) -> Self {
        Self {
            years_experience,
            education_level_ordinal,
            seniority_ordinal,
        }
    }

    /// Metrics of a profile document. Publications and profiles carrying
    /// none of the signals have no metrics.
    pub fn from_metadata(metadata: &DocumentMetadata) -> Option<Self> {
        let (years, education, career) = match metadata {
            DocumentMetadata::AuthorProfile(p) => (p.years_experience, p.education_level, p.career_level),
            DocumentMetadata::LinkedinProfile(p) => (p.years_experience, p.education_level, p.career_level),
            DocumentMetadata::Publication(_) => return None,
        };

        if years.is_none() && education.is_none() && career.is_none() {
            return None;
        }

        Some(Self {
            years_experience: years.filter(|y| y.is_finite()).unwrap_or(0.0).max(0.0),
            education_level_ordinal: education.map(|e| e.ordinal()).unwrap_or(0),
            seniority_ordinal: career.map(|c| c.ordinal()).unwrap_or(0),
        })
    }

    pub fn raw_score(&self, weights: &CredibilityWeights) -> f64 {
        weights.years_experience * self.years_experience
            + weights.education * f64::from(self.education_level_ordinal)
            + weights.seniority * f64::from(self.seniority_ordinal)
    }

    fn education(&self) -> EducationLevel {
        match self.education_level_ordinal {
            3 => EducationLevel::Phd,
            2 => EducationLevel::Master,
            1 => EducationLevel::Bachelor,
            _ => EducationLevel::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperienceHistogram {
    #[serde(rename = "0-5")]
    pub under_5: usize,
    #[serde(rename = "5-10")]
    pub from_5_to_10: usize,
    #[serde(rename = "10-15")]
    pub from_10_to_15: usize,
    #[serde(rename = "15+")]
    pub over_15: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EducationHistogram {
    pub bachelor: usize,
    pub master: usize,
    pub phd: usize,
    pub other: usize,
}

/// Shape of the corpus the percentiles were computed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub experience: ExperienceHistogram,
    pub education: EducationHistogram,
    pub max_years: f64,
}

impl Distribution {
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a EntityMetrics>) -> Self {
        let mut dist = Distribution::default();
        for m in metrics {
            let years = m.years_experience;
            match years {
                y if y < 5.0 => dist.experience.under_5 += 1,
                y if y < 10.0 => dist.experience.from_5_to_10 += 1,
                y if y < 15.0 => dist.experience.from_10_to_15 += 1,
                _ => dist.experience.over_15 += 1,
            }
            match m.education() {
                EducationLevel::Bachelor => dist.education.bachelor += 1,
                EducationLevel::Master => dist.education.master += 1,
                EducationLevel::Phd => dist.education.phd += 1,
                EducationLevel::Other => dist.education.other += 1,
            }
            dist.max_years = dist.max_years.max(years);
        }
        dist
    }
}
