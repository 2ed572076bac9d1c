use regex::Regex;

use crate::config::ResolverConfig;

/**
    Matches a `<source>` tag whose `src` attribute points at an HLS manifest
    (contains `m3u8?`), capturing the attribute value.
*/
pub const SOURCE_PATTERN: &str = r#"<source\s+(?:[^>]*?\s)?src\s*=\s*"(?P<src>[^"]*m3u8\?[^"]*)""#;

/**
    Extracts the stream manifest address from rendered watch pages.
*/
#[derive(Debug, Clone)]
pub struct SourceExtractor {
    pattern: Regex,
}

impl SourceExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_pattern(SOURCE_PATTERN)
    }

    /**
        Create the extractor for the configured pattern, or the built-in one.
    */
    pub fn from_config(config: &ResolverConfig) -> Result<Self, regex::Error> {
        match &config.source_pattern {
            Some(pattern) => Self::with_pattern(pattern),
            None => Self::new(),
        }
    }

    /**
        Create an extractor from a custom pattern, which must have a `src` group.
    */
    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().any(|name| name == Some("src")) {
            return Err(regex::Error::Syntax(format!(
                "pattern '{pattern}' has no `src` capture group"
            )));
        }
        Ok(Self { pattern })
    }

    /**
        Find the first matching source in `html`.
    */
    pub fn extract(&self, html: &str) -> Option<String> {
        let captures = self.pattern.captures(html)?;
        let src = captures.name("src")?.as_str();
        Some(unescape_attribute(src))
    }
}

// Serialized DOM escapes `&` in attribute values
fn unescape_attribute(value: &str) -> String {
    value.replace("&amp;", "&")
}
