use anyhow::{Context, Result};
use regex::Regex;

use crate::models::{FrameRecord, OcrRecord};

use super::{AppParser, ParsedField};

const BROWSERS: [&str; 8] = [
    "safari", "chrome", "chromium", "firefox", "edge", "brave", "arc", "opera",
];

/// Reads URLs out of browser address bars and page text.
pub struct UrlParser {
    url: Regex,
}

impl UrlParser {
    pub fn new() -> Result<Self> {
        let url = Regex::new(r"(?i)\b(?:https?://)?(?:[a-z0-9-]+\.)+[a-z]{2,}(?::\d{2,5})?(?:/[^\s]*)?")
            .context("Failed to compile URL pattern")?;
        Ok(Self { url })
    }
}

impl AppParser for UrlParser {
    fn name(&self) -> &str {
        "url"
    }

    fn applies_to(&self, app_name: &str) -> bool {
        let app = app_name.to_lowercase();
        BROWSERS.iter().any(|browser| app.contains(browser))
    }

    fn parse(&self, frame: &FrameRecord, ocr: &[OcrRecord]) -> Vec<ParsedField> {
        let mut fields = Vec::new();
        for row in ocr {
            for found in self.url.find_iter(&row.text) {
                let value = found.as_str().trim_end_matches(['.', ',', ')', ';']);
                // Require a scheme or a path so plain words with dots are skipped.
                if !value.contains("://") && !value.contains('/') {
                    continue;
                }
                fields.push(ParsedField {
                    parser: self.name().to_string(),
                    frame_id: frame.frame_id.clone(),
                    ts_ns: frame.ts_ns,
                    region_id: Some(row.region_id.clone()),
                    key: "url".to_string(),
                    value: value.to_string(),
                    confidence: row.confidence,
                });
            }
        }
        fields
    }
}
