//! Section parsing.
//!
//! Splits raw generated text into named, ordered sections using the
//! profile's expected markers. Markers are matched tolerantly: case,
//! whitespace, punctuation, emoji decoration and leading enumeration are
//! ignored. If a required marker is still missing, one positional fallback
//! is tried before giving up with [`ParseError`].
//!
//! Every byte of the input ends up in exactly one section, so
//! `serialize_sections(&parse(text)?) == text` always holds.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::{QualityProfile, SectionSpec};
use crate::types::Section;

lazy_static! {
    /// Leading enumeration such as "1.", "2)", "IV." or "Block 3 -".
    static ref LEADING_ENUMERATION: Regex =
        Regex::new(r"^(?:(?:block|блок|part|часть)\s+)?(?:\d+|[ivx]+)\s+").unwrap();
}

/// Longest line (in chars) that can still be a header.
const MAX_HEADER_CHARS: usize = 120;

/// Structural failure: required sections missing after fallback.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Missing required sections: {}", .missing.join(", "))]
pub struct ParseError {
    /// Names of the required sections that could not be located
    pub missing: Vec<String>,
}

/// Normalize a header line for tolerant comparison.
///
/// Lowercases, drops everything that is not a letter or digit, collapses
/// whitespace and strips a leading enumeration.
pub fn normalize_marker(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;

    for ch in line.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }

    match LEADING_ENUMERATION.find(&out) {
        Some(m) if m.end() < out.len() => out[m.end()..].to_string(),
        _ => out,
    }
}

/// A line of the input with its byte offset.
#[derive(Debug, Clone, Copy)]
struct Line<'t> {
    start: usize,
    text: &'t str,
    in_fence: bool,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut offset = 0;
    let mut in_fence = false;

    for raw in text.split_inclusive('\n') {
        let is_fence = raw.trim_start().starts_with("```");
        lines.push(Line {
            start: offset,
            text: raw,
            in_fence: in_fence || is_fence,
        });
        if is_fence {
            in_fence = !in_fence;
        }
        offset += raw.len();
    }

    lines
}

/// A line that looks like a header but may not match any marker.
fn is_heading_like(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 80 {
        return false;
    }
    if trimmed.ends_with(['.', ',', ';']) {
        return false;
    }
    let letters = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    if letters < 2 {
        return false;
    }
    let first = trimmed.chars().next().unwrap_or(' ');
    first == '#'
        || (!first.is_alphanumeric() && !matches!(first, '-' | '*' | '•' | '(' | '"' | '«'))
        || is_all_caps(trimmed)
        || trimmed.ends_with(':')
}

/// A line that clearly opens a new top-level block of text.
///
/// Markdown headings always do. An all-caps line only does when it stands
/// alone: after a blank line, or free of punctuation (so `NASDAQ: ACME`
/// inside a paragraph stays body text).
fn is_strong_heading(line: &str, previous: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return trimmed.trim_start_matches('#').trim().chars().any(char::is_alphabetic);
    }
    if trimmed.chars().count() > 80 || !is_all_caps(trimmed) {
        return false;
    }
    previous.trim().is_empty() || !trimmed.chars().any(|c| c.is_ascii_punctuation())
}

fn is_all_caps(s: &str) -> bool {
    let mut letters = 0;
    for c in s.chars().filter(|c| c.is_alphabetic()) {
        if c.is_lowercase() {
            return false;
        }
        letters += 1;
    }
    letters >= 3
}

/// A located header: line index and the spec it opens.
#[derive(Debug, Clone, Copy)]
struct Header {
    line: usize,
    spec: usize,
    inferred: bool,
}

/// Splits artifacts into sections according to a profile.
pub struct SectionParser<'p> {
    specs: &'p [SectionSpec],
    /// Normalized header text -> spec index
    lookup: Vec<(String, usize)>,
}

impl<'p> SectionParser<'p> {
    pub fn new(profile: &'p QualityProfile) -> Self {
        let lookup = profile
            .sections
            .iter()
            .enumerate()
            .flat_map(|(idx, spec)| spec.headers().map(move |h| (normalize_marker(h), idx)))
            .collect();

        Self {
            specs: &profile.sections,
            lookup,
        }
    }

    /// Name of the section whose marker this line is, if any.
    pub fn marker_section(&self, line: &str) -> Option<&'p str> {
        self.match_marker(line).map(|idx| self.specs[idx].name.as_str())
    }

    fn match_marker(&self, line: &str) -> Option<usize> {
        if line.trim().chars().count() > MAX_HEADER_CHARS {
            return None;
        }
        let normalized = normalize_marker(line);
        if normalized.is_empty() {
            return None;
        }
        self.lookup
            .iter()
            .find(|(marker, _)| *marker == normalized)
            .map(|(_, idx)| *idx)
    }

    /// Parse text into ordered sections.
    pub fn parse(&self, text: &str) -> Result<Vec<Section>, ParseError> {
        let lines = split_lines(text);
        let mut headers = self.match_headers(&lines);

        if self.missing_required(&headers).next().is_some() {
            self.infer_positions(&lines, &mut headers);
            tracing::debug!(
                inferred = headers.iter().filter(|h| h.inferred).count(),
                "Positional fallback applied"
            );
        }

        let missing: Vec<String> = self
            .missing_required(&headers)
            .map(|spec| spec.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ParseError { missing });
        }

        headers.sort_by_key(|h| h.line);
        Ok(self.build_sections(text, &lines, &headers))
    }

    /// First occurrence of each marker, outside fenced blocks.
    fn match_headers(&self, lines: &[Line<'_>]) -> Vec<Header> {
        let mut headers: Vec<Header> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if line.in_fence {
                continue;
            }
            if let Some(spec) = self.match_marker(line.text) {
                if headers.iter().all(|h| h.spec != spec) {
                    headers.push(Header {
                        line: idx,
                        spec,
                        inferred: false,
                    });
                }
            }
        }

        headers
    }

    fn missing_required<'a>(&'a self, headers: &'a [Header]) -> impl Iterator<Item = &'p SectionSpec> + 'a {
        self.specs
            .iter()
            .enumerate()
            .filter(move |(idx, spec)| spec.required && headers.iter().all(|h| h.spec != *idx))
            .map(|(_, spec)| spec)
    }

    /// Positional inference: assign unmatched header-like lines to missing
    /// specs that sit between the same pair of located neighbours.
    fn infer_positions(&self, lines: &[Line<'_>], headers: &mut Vec<Header>) {
        let located = |spec: usize, headers: &[Header]| {
            headers.iter().find(|h| h.spec == spec).map(|h| h.line)
        };

        let mut spec_idx = 0;
        while spec_idx < self.specs.len() {
            if located(spec_idx, headers).is_some() {
                spec_idx += 1;
                continue;
            }

            // Run of consecutive missing specs [spec_idx, run_end)
            let mut run_end = spec_idx;
            while run_end < self.specs.len() && located(run_end, headers).is_none() {
                run_end += 1;
            }

            let lower = (0..spec_idx)
                .rev()
                .find_map(|s| located(s, headers))
                .map(|l| l + 1)
                .unwrap_or(0);
            let upper = (run_end..self.specs.len())
                .find_map(|s| located(s, headers))
                .unwrap_or(lines.len());

            let candidates: Vec<usize> = (lower..upper)
                .filter(|&l| {
                    !lines[l].in_fence
                        && is_heading_like(lines[l].text)
                        && self.match_marker(lines[l].text).is_none()
                })
                .collect();

            let run: Vec<usize> = (spec_idx..run_end).collect();
            let required: Vec<usize> = run
                .iter()
                .copied()
                .filter(|&s| self.specs[s].required)
                .collect();

            let assignment = if candidates.len() == run.len() {
                Some(run)
            } else if !required.is_empty() && candidates.len() == required.len() {
                Some(required)
            } else {
                None
            };

            if let Some(specs) = assignment {
                for (spec, line) in specs.into_iter().zip(candidates) {
                    tracing::debug!(
                        section = %self.specs[spec].name,
                        line = lines[line].text.trim(),
                        "Inferred section header from position"
                    );
                    headers.push(Header {
                        line,
                        spec,
                        inferred: true,
                    });
                }
            }

            spec_idx = run_end;
        }
    }

    fn build_sections(&self, text: &str, lines: &[Line<'_>], headers: &[Header]) -> Vec<Section> {
        let mut sections = Vec::new();
        let line_start = |idx: usize| lines.get(idx).map(|l| l.start).unwrap_or(text.len());

        let first = headers.first().map(|h| line_start(h.line)).unwrap_or(text.len());
        if first > 0 {
            sections.push(unnamed(0, &text[..first]));
        }

        for (i, header) in headers.iter().enumerate() {
            let start = line_start(header.line);
            let is_last = i + 1 == headers.len();
            let mut end = headers
                .get(i + 1)
                .map(|next| line_start(next.line))
                .unwrap_or(text.len());

            // Unknown trailing content after the last known section
            let mut trailing = None;
            if is_last {
                let split = (header.line + 1..lines.len()).find(|&i| {
                    !lines[i].in_fence
                        && is_strong_heading(lines[i].text, lines[i - 1].text)
                        && self.match_marker(lines[i].text).is_none()
                });
                if let Some(i) = split {
                    trailing = Some(lines[i].start);
                    end = lines[i].start;
                }
            }

            let spec = &self.specs[header.spec];
            sections.push(Section {
                name: Some(spec.name.clone()),
                order_index: sections.len(),
                required: spec.required,
                raw_text: text[start..end].to_string(),
                header_len: lines[header.line].text.len(),
                inferred: header.inferred,
                structured_block: None,
            });

            if let Some(split) = trailing {
                sections.push(unnamed(sections.len(), &text[split..]));
            }
        }

        sections
    }
}

fn unnamed(order_index: usize, raw: &str) -> Section {
    Section {
        name: None,
        order_index,
        required: false,
        raw_text: raw.to_string(),
        header_len: 0,
        inferred: false,
        structured_block: None,
    }
}

/// Count words the way length criteria do.
pub fn word_count(s: &str) -> usize {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .count()
}
