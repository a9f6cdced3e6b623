//! Quality profile parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::criteria::{Criterion, CriterionKind, RuleCheck};
use super::schema::validate_profile_schema;
use crate::sections::normalize_marker;

/// Errors that can occur when loading a quality profile.
///
/// All of these are startup-fatal: a profile that fails to load must stop
/// the process before any artifact is judged.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Profile does not match schema: {0}")]
    SchemaViolation(String),

    #[error("Profile validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// An expected section marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionSpec {
    /// Stable section name used by criteria and patches
    pub name: String,

    /// Header text as it should appear in the artifact
    pub marker: String,

    /// Alternative header texts accepted as the same section
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Whether the artifact is structurally broken without it
    #[serde(default = "default_true")]
    pub required: bool,

    /// Schema id of the structured block this section carries
    #[serde(default)]
    pub block: Option<String>,
}

impl SectionSpec {
    /// All accepted header texts, marker first.
    pub fn headers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.marker.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Expected shape of a structured block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockSchemaSpec {
    pub id: String,
    pub fields: Vec<String>,
}

/// Which signal wins when a section fails its sub-threshold while the
/// global total is in the ACCEPT band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SectionPrecedence {
    /// Patch the failing section anyway
    #[default]
    Patch,
    /// Accept on the global total
    Accept,
}

/// Decision band thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub accept: f64,
    pub patch: f64,
    pub regenerate: f64,

    /// Per-section sub-score below which a section is patch-eligible
    pub section_patch: f64,

    #[serde(default)]
    pub section_precedence: SectionPrecedence,
}

/// Retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Limits {
    #[serde(default = "default_max_patch_rounds")]
    pub max_patch_rounds: u32,

    #[serde(default = "default_max_regenerate_rounds")]
    pub max_regenerate_rounds: u32,

    /// A replacement shorter than this fraction of the original body is refused
    #[serde(default = "default_min_replacement_ratio")]
    pub min_replacement_ratio: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_patch_rounds: default_max_patch_rounds(),
            max_regenerate_rounds: default_max_regenerate_rounds(),
            min_replacement_ratio: default_min_replacement_ratio(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_patch_rounds() -> u32 {
    3
}

fn default_max_regenerate_rounds() -> u32 {
    2
}

fn default_min_replacement_ratio() -> f64 {
    0.7
}

fn default_block_fence() -> String {
    "data".to_string()
}

/// A quality profile: expected structure, criteria and decision policy.
///
/// Loaded once at startup and shared read-only for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityProfile {
    /// Version of this profile (semver)
    pub profile_version: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Expected sections in document order
    pub sections: Vec<SectionSpec>,

    /// Structured block schemas referenced by sections
    #[serde(default)]
    pub blocks: Vec<BlockSchemaSpec>,

    /// Info string that opens a structured block fence
    #[serde(default = "default_block_fence")]
    pub block_fence: String,

    pub criteria: Vec<Criterion>,

    pub thresholds: Thresholds,

    #[serde(default)]
    pub limits: Limits,
}

impl QualityProfile {
    /// Parse a profile from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ProfileError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a profile from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a profile from a file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ProfileError> {
        validate_profile_schema(&value)
            .map_err(|errors| ProfileError::SchemaViolation(errors.join("; ")))?;

        let profile: QualityProfile = serde_json::from_value(value)?;
        profile.validate()?;

        tracing::debug!(
            profile = %profile.name,
            sections = profile.sections.len(),
            criteria = profile.criteria.len(),
            "Loaded quality profile"
        );
        Ok(profile)
    }

    /// Validate cross-references and numeric ranges.
    fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::MissingField("name".to_string()));
        }
        if self.sections.is_empty() {
            return Err(ProfileError::MissingField("sections".to_string()));
        }
        if self.criteria.is_empty() {
            return Err(ProfileError::MissingField("criteria".to_string()));
        }

        self.validate_sections()?;
        self.validate_criteria()?;
        self.validate_thresholds()?;

        if !(0.0..=1.0).contains(&self.limits.min_replacement_ratio) {
            return Err(invalid("limits.min_replacement_ratio must be within [0, 1]"));
        }

        Ok(())
    }

    fn validate_sections(&self) -> Result<(), ProfileError> {
        let mut names = HashSet::new();
        let mut headers = HashSet::new();

        for spec in &self.sections {
            if !names.insert(spec.name.as_str()) {
                return Err(invalid(format!("Duplicate section name: {}", spec.name)));
            }
            for header in spec.headers() {
                let normalized = normalize_marker(header);
                if normalized.is_empty() {
                    return Err(invalid(format!(
                        "Section '{}' has a marker with no letters or digits",
                        spec.name
                    )));
                }
                if !headers.insert(normalized) {
                    return Err(invalid(format!(
                        "Marker '{}' of section '{}' collides with another section",
                        header, spec.name
                    )));
                }
            }
            if let Some(block) = &spec.block {
                if self.block_schema(block).is_none() {
                    return Err(invalid(format!(
                        "Section '{}' references unknown block schema '{}'",
                        spec.name, block
                    )));
                }
            }
        }

        let mut block_ids = HashSet::new();
        for block in &self.blocks {
            if !block_ids.insert(block.id.as_str()) {
                return Err(invalid(format!("Duplicate block schema id: {}", block.id)));
            }
            if block.fields.is_empty() {
                return Err(invalid(format!("Block schema '{}' declares no fields", block.id)));
            }
        }

        Ok(())
    }

    fn validate_criteria(&self) -> Result<(), ProfileError> {
        let mut seen = HashSet::new();

        for c in &self.criteria {
            if !seen.insert(c.id.as_str()) {
                return Err(invalid(format!("Duplicate criterion ID: {}", c.id)));
            }
            if !(c.weight > 0.0 && c.weight <= 1.0) {
                return Err(invalid(format!(
                    "Criterion {} weight {} is outside (0, 1]",
                    c.id, c.weight
                )));
            }
            if !(0.0..=1.0).contains(&c.pass_threshold) {
                return Err(invalid(format!(
                    "Criterion {} pass_threshold {} is outside [0, 1]",
                    c.id, c.pass_threshold
                )));
            }
            if let Some(section) = &c.section {
                if self.section_spec(section).is_none() {
                    return Err(invalid(format!(
                        "Criterion {} targets unknown section '{}'",
                        c.id, section
                    )));
                }
            }

            match (c.kind, &c.check) {
                (CriterionKind::Rule, None) => {
                    return Err(ProfileError::MissingField(format!("criteria[{}].check", c.id)));
                }
                (CriterionKind::Critic, Some(_)) => {
                    return Err(invalid(format!(
                        "Critic criterion {} must not declare a rule check",
                        c.id
                    )));
                }
                (CriterionKind::Rule, Some(check)) => self.validate_check(c, check)?,
                (CriterionKind::Critic, None) => {}
            }
        }

        Ok(())
    }

    fn validate_check(&self, c: &Criterion, check: &RuleCheck) -> Result<(), ProfileError> {
        if check.requires_section() && c.section.is_none() {
            return Err(invalid(format!(
                "Criterion {} uses {} which needs a section",
                c.id,
                check.name()
            )));
        }

        match check {
            RuleCheck::LengthBounds {
                min_words,
                max_words: Some(max),
            } if max < min_words => Err(invalid(format!(
                "Criterion {}: max_words {} is below min_words {}",
                c.id, max, min_words
            ))),
            RuleCheck::NumericRange { min, max, .. } if min > max => Err(invalid(format!(
                "Criterion {}: numeric range min {} exceeds max {}",
                c.id, min, max
            ))),
            RuleCheck::PlaceholderLeakage { extra_patterns } => {
                for pattern in extra_patterns {
                    if let Err(e) = regex::Regex::new(pattern) {
                        return Err(invalid(format!(
                            "Criterion {}: invalid placeholder pattern '{}': {}",
                            c.id, pattern, e
                        )));
                    }
                }
                Ok(())
            }
            RuleCheck::ForbiddenPhrases { phrases } if phrases.is_empty() => Err(invalid(format!(
                "Criterion {}: forbidden_phrases needs at least one phrase",
                c.id
            ))),
            RuleCheck::CrossReference { fields, sections } => {
                if fields.is_empty() || sections.len() < 2 {
                    return Err(invalid(format!(
                        "Criterion {}: cross_reference needs fields and at least two sections",
                        c.id
                    )));
                }
                for s in sections {
                    if self.section_spec(s).is_none() {
                        return Err(invalid(format!(
                            "Criterion {} cross-references unknown section '{}'",
                            c.id, s
                        )));
                    }
                }
                Ok(())
            }
            RuleCheck::BlockSchema => {
                let has_block = c
                    .section
                    .as_deref()
                    .and_then(|s| self.section_spec(s))
                    .map(|s| s.block.is_some())
                    .unwrap_or(false);
                if has_block {
                    Ok(())
                } else {
                    Err(invalid(format!(
                        "Criterion {}: block_schema targets a section without a block",
                        c.id
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    fn validate_thresholds(&self) -> Result<(), ProfileError> {
        let t = &self.thresholds;
        let ordered = 0.0 <= t.regenerate
            && t.regenerate <= t.patch
            && t.patch <= t.accept
            && t.accept <= 1.0;
        if !ordered {
            return Err(invalid(format!(
                "Thresholds must satisfy 0 <= regenerate ({}) <= patch ({}) <= accept ({}) <= 1",
                t.regenerate, t.patch, t.accept
            )));
        }
        if !(0.0..=1.0).contains(&t.section_patch) {
            return Err(invalid("thresholds.section_patch must be within [0, 1]"));
        }
        Ok(())
    }

    /// Look up a criterion by id.
    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }

    /// Look up an expected section by name.
    pub fn section_spec(&self, name: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Look up a block schema by id.
    pub fn block_schema(&self, id: &str) -> Option<&BlockSchemaSpec> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Rule criteria in profile order.
    pub fn rule_criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter().filter(|c| c.is_rule())
    }

    /// Critic criteria in profile order.
    pub fn critic_criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter().filter(|c| c.is_critic())
    }

    /// Criteria scoped to the given section.
    pub fn criteria_for_section<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a Criterion> {
        self.criteria.iter().filter(move |c| c.targets(section))
    }
}

fn invalid(msg: impl Into<String>) -> ProfileError {
    ProfileError::ValidationError(msg.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const VALID_PROFILE: &str = r#"
profile_version: "1.0"
name: "Company forecast"
sections:
  - name: overview
    marker: "Overview"
  - name: forecast
    marker: "Forecast"
    aliases: ["Outlook"]
    block: forecast_data
  - name: advice
    marker: "Recommendations"
    required: false
blocks:
  - id: forecast_data
    fields: [sign, growth_index]
criteria:
  - id: R1
    kind: rule
    weight: 0.3
    section: forecast
    check: { type: section_present }
  - id: R2
    kind: rule
    weight: 0.2
    section: forecast
    check: { type: length_bounds, min_words: 5 }
  - id: C1
    kind: critic
    weight: 0.5
    dimension: tone
thresholds:
  accept: 0.8
  patch: 0.6
  regenerate: 0.3
  section_patch: 0.5
"#;

    #[test]
    fn test_parse_valid_profile() {
        let profile = QualityProfile::from_yaml(VALID_PROFILE).unwrap();
        assert_eq!(profile.name, "Company forecast");
        assert_eq!(profile.sections.len(), 3);
        assert_eq!(profile.rule_criteria().count(), 2);
        assert_eq!(profile.critic_criteria().count(), 1);
        assert_eq!(profile.limits.max_patch_rounds, 3);
        assert_eq!(profile.thresholds.section_precedence, SectionPrecedence::Patch);
    }

    #[test]
    fn test_bundled_profile_loads() {
        let yaml = include_str!("../../../../profiles/company-zodiac.yaml");
        let profile = QualityProfile::from_yaml(yaml).unwrap();
        assert_eq!(profile.sections.len(), 6);
        assert!(profile.critic_criteria().count() > 0);
        assert!(profile.section_spec("risks").is_some());
    }

    #[test]
    fn test_duplicate_criterion_ids() {
        let yaml = VALID_PROFILE.replace("id: R2", "id: R1");
        let result = QualityProfile::from_yaml(&yaml);
        assert!(matches!(result, Err(ProfileError::ValidationError(_))));
    }

    #[test]
    fn test_weight_out_of_range() {
        let yaml = VALID_PROFILE.replace("weight: 0.5", "weight: 1.5");
        assert!(QualityProfile::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_unordered_thresholds() {
        let yaml = VALID_PROFILE.replace("patch: 0.6", "patch: 0.9");
        let result = QualityProfile::from_yaml(&yaml);
        assert!(matches!(result, Err(ProfileError::ValidationError(_))));
    }

    #[test]
    fn test_unknown_section_affinity() {
        let yaml = VALID_PROFILE.replace("section: forecast\n    check: { type: length", "section: epilogue\n    check: { type: length");
        let result = QualityProfile::from_yaml(&yaml);
        assert!(matches!(result, Err(ProfileError::ValidationError(_))));
    }

    #[test]
    fn test_rule_without_check() {
        let yaml = VALID_PROFILE.replace("    check: { type: section_present }\n", "");
        let result = QualityProfile::from_yaml(&yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_colliding_markers() {
        let yaml = VALID_PROFILE.replace("aliases: [\"Outlook\"]", "aliases: [\"overview!\"]");
        let result = QualityProfile::from_yaml(&yaml);
        assert!(matches!(result, Err(ProfileError::ValidationError(_))));
    }

    #[test]
    fn test_json_profile() {
        let profile = QualityProfile::from_yaml(VALID_PROFILE).unwrap();
        let json = serde_json::to_string(&profile).unwrap();
        let reparsed = QualityProfile::from_json(&json).unwrap();
        assert_eq!(reparsed.criteria, profile.criteria);
    }
}
