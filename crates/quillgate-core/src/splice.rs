//! Section splicing.
//!
//! Replaces the body of one section while leaving every other section
//! byte-identical. The section keeps its original header line; a replacement
//! that echoes the header has it stripped. Section count and order never
//! change.

use thiserror::Error;

use crate::blocks::{SchemaError, StructuredBlockExtractor};
use crate::profile::QualityProfile;
use crate::sections::{normalize_marker, SectionParser};
use crate::types::{serialize_sections, Section};

/// Why a replacement could not be spliced in.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpliceError {
    #[error("Section '{0}' is not present in the artifact")]
    UnknownSection(String),

    #[error("Replacement for section '{0}' is blank")]
    EmptyReplacement(String),

    #[error("Replacement for section '{section}' is {ratio:.2} of the original length (minimum {min_ratio:.2})")]
    TooShort {
        section: String,
        ratio: f64,
        min_ratio: f64,
    },

    #[error("Replacement for section '{section}' contains the header of section '{other}'")]
    IntroducesHeader { section: String, other: String },

    #[error("Replacement for section '{0}' leaves a ``` fence open")]
    UnbalancedFence(String),

    #[error("Replacement for section '{0}' changes the section boundaries of the artifact")]
    BoundariesMoved(String),
}

/// Result of a successful splice.
#[derive(Debug, Clone, PartialEq)]
pub struct Spliced {
    pub sections: Vec<Section>,

    /// Set when the patched section's block could not be recovered
    pub schema_error: Option<SchemaError>,
}

/// Splices replacement bodies into parsed sections.
pub struct Splicer<'p> {
    profile: &'p QualityProfile,
    parser: SectionParser<'p>,
}

impl<'p> Splicer<'p> {
    pub fn new(profile: &'p QualityProfile) -> Self {
        Self {
            profile,
            parser: SectionParser::new(profile),
        }
    }

    /// Replace the body of section `name` and re-extract its block.
    ///
    /// The input is never modified; a new section list is returned.
    pub fn splice(&self, sections: &[Section], name: &str, replacement: &str) -> Result<Spliced, SpliceError> {
        let idx = sections
            .iter()
            .position(|s| s.is_named(name))
            .ok_or_else(|| SpliceError::UnknownSection(name.to_string()))?;
        let target = &sections[idx];

        let content = strip_echoed_header(replacement, target.header()).trim();
        if content.is_empty() {
            return Err(SpliceError::EmptyReplacement(name.to_string()));
        }

        let original = target.body().trim();
        if !original.is_empty() {
            let ratio = content.chars().count() as f64 / original.chars().count() as f64;
            let min_ratio = self.profile.limits.min_replacement_ratio;
            if ratio < min_ratio {
                return Err(SpliceError::TooShort {
                    section: name.to_string(),
                    ratio,
                    min_ratio,
                });
            }
        }

        if let Some(other) = content
            .lines()
            .filter_map(|line| self.parser.marker_section(line))
            .find(|other| *other != name)
        {
            return Err(SpliceError::IntroducesHeader {
                section: name.to_string(),
                other: other.to_string(),
            });
        }

        let fences = content.lines().filter(|line| line.trim_start().starts_with("```")).count();
        if fences % 2 != 0 {
            return Err(SpliceError::UnbalancedFence(name.to_string()));
        }

        let mut patched = target.clone();
        let (raw_text, header_len) = rebuild(target, content);
        patched.raw_text = raw_text;
        patched.header_len = header_len;

        let schema_error = StructuredBlockExtractor::new(self.profile).extract(&mut patched).err();

        let mut out = sections.to_vec();
        out[idx] = patched;

        // The spliced text must parse back into the same sections
        let reparsed = self.parser.parse(&serialize_sections(&out));
        let kept = reparsed.is_ok_and(|again| {
            again.len() == out.len() && again.iter().zip(&out).all(|(a, b)| a.name == b.name)
        });
        if !kept {
            return Err(SpliceError::BoundariesMoved(name.to_string()));
        }

        Ok(Spliced {
            sections: out,
            schema_error,
        })
    }
}

/// Drop a leading line that repeats the section header.
fn strip_echoed_header<'r>(replacement: &'r str, header: &str) -> &'r str {
    let trimmed = replacement.trim_start();
    let wanted = normalize_marker(header);
    if wanted.is_empty() {
        return trimmed;
    }

    let (first, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };
    if normalize_marker(first) == wanted {
        rest
    } else {
        trimmed
    }
}

/// Header + original leading whitespace + content + original trailing whitespace.
///
/// Returns the new raw text and header length.
fn rebuild(target: &Section, content: &str) -> (String, usize) {
    let header = target.header();
    let body = target.body();
    let lead = &body[..body.len() - body.trim_start().len()];
    let mut trail = &body[body.trim_end().len()..];
    if body.trim().is_empty() {
        trail = if body.ends_with('\n') { "\n" } else { "" };
    }

    let mut out = String::with_capacity(header.len() + content.len() + 2);
    out.push_str(header);
    if !header.is_empty() && !header.ends_with('\n') {
        out.push('\n');
    }
    let header_len = out.len();
    if !body.trim().is_empty() {
        out.push_str(lead);
    }
    out.push_str(content);
    out.push_str(trail);
    (out, header_len)
}
