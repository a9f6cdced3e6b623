//! Shared detection patterns for rule checks.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // =========================================================================
    // TEMPLATE LEAKAGE
    // =========================================================================

    /// Unfilled template slots: {{name}}, {company_name}, [INSERT ...], <PLACEHOLDER>
    pub static ref PLACEHOLDER_PATTERN: Regex = Regex::new(
        r"(?i)\{\{[^}]*\}\}|\{[a-z_][a-z0-9_]*\}|\[(?:insert|вставить|placeholder|todo)[^\]]*\]|<(?:placeholder|[A-Z][A-Z0-9_]{2,})>"
    ).unwrap();

    /// Author notes left in the text
    pub static ref BOILERPLATE_PATTERN: Regex = Regex::new(
        r"(?im)\bTODO\b|\bTBD\b|lorem ipsum|^\s*N/?A\s*$"
    ).unwrap();

    /// Mentions of data vendors and model providers the reader must not see
    pub static ref SOURCE_MENTION_PATTERN: Regex = Regex::new(
        r"(?i)\b(?:newsdata(?:\.io)?|prokerala|openai|chatgpt|gemini|anthropic|claude|api)\b"
    ).unwrap();

    // =========================================================================
    // MARKUP
    // =========================================================================

    /// Markdown headings, emphasis, links, inline code and list bullets
    pub static ref MARKDOWN_PATTERN: Regex = Regex::new(
        r"(?m)^\s{0,3}#{1,6}\s|\*\*[^*\n]+\*\*|__[^_\n]+__|\[[^\]\n]+\]\([^)\n]+\)|`[^`\n]+`|^\s*[-*+]\s+\S"
    ).unwrap();

    /// HTML tags
    pub static ref HTML_PATTERN: Regex = Regex::new(
        r"</?[a-zA-Z][a-zA-Z0-9]*(?:\s[^<>]*)?/?>"
    ).unwrap();

    // =========================================================================
    // FIGURES
    // =========================================================================

    /// Inline percentages such as "12%", "-3,5 %"
    pub static ref PERCENT_PATTERN: Regex = Regex::new(
        r"(-?\d+(?:[.,]\d+)?)\s*%"
    ).unwrap();
}

/// Count placeholder, boilerplate and source-mention hits.
pub fn leakage_hits(content: &str) -> Vec<String> {
    PLACEHOLDER_PATTERN
        .find_iter(content)
        .chain(BOILERPLATE_PATTERN.find_iter(content))
        .chain(SOURCE_MENTION_PATTERN.find_iter(content))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// Markdown and HTML constructs present in content.
pub fn markup_hits(content: &str) -> Vec<String> {
    MARKDOWN_PATTERN
        .find_iter(content)
        .chain(HTML_PATTERN.find_iter(content))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// Inline percentage figures.
pub fn percentages(content: &str) -> Vec<f64> {
    PERCENT_PATTERN
        .captures_iter(content)
        .filter_map(|c| c[1].replace(',', ".").parse().ok())
        .collect()
}

/// Text with fenced regions removed.
pub fn strip_fences(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_fence = false;
    for line in content.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_detection() {
        assert_eq!(leakage_hits("Dear {{client}}, see [INSERT DATE].").len(), 2);
        assert_eq!(leakage_hits("Company {company_name} grows").len(), 1);
        assert!(leakage_hits("A clean sentence about growth.").is_empty());
    }

    #[test]
    fn test_source_mentions() {
        let hits = leakage_hits("Data from Prokerala and the NewsData API");
        assert_eq!(hits.len(), 3);
        // "capital" must not match "api"
        assert!(leakage_hits("Working capital rises").is_empty());
    }

    #[test]
    fn test_markup_detection() {
        assert!(!markup_hits("## Title").is_empty());
        assert!(!markup_hits("this is **bold**").is_empty());
        assert!(!markup_hits("<b>bold</b>").is_empty());
        assert!(!markup_hits("- bullet item").is_empty());
        assert!(markup_hits("🌟 Plain text with emoji icons - and a dash.").is_empty());
    }

    #[test]
    fn test_percentages() {
        assert_eq!(percentages("growth 12% and -3,5 % drop"), vec![12.0, -3.5]);
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("a\n```data\n**x**\n```\nb\n"), "a\nb\n");
    }
}
