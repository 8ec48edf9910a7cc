//! Config-driven format descriptor.
//!
//! Covers sources without a built-in: the config supplies a filename glob,
//! a timestamp regex with one capture group, a timestamp layout (`unix`,
//! `unix_ms`, or a chrono format string), a header-skip count, and the
//! Content-Type. Regex and glob are compiled once at registry construction.

use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use super::{is_blank, FormatError, LogFormat};
use crate::config::FormatConfig;

pub struct GenericFormat {
    config: FormatConfig,
    timestamp_regex: Regex,
    filename_pattern: glob::Pattern,
}

impl GenericFormat {
    pub fn new(config: FormatConfig) -> Result<GenericFormat, FormatError> {
        let timestamp_regex =
            Regex::new(&config.timestamp_regex).map_err(|source| FormatError::InvalidRegex {
                name: config.name.clone(),
                source,
            })?;
        let filename_pattern = glob::Pattern::new(&config.filename_pattern).map_err(|source| {
            FormatError::InvalidPattern {
                name: config.name.clone(),
                source,
            }
        })?;
        Ok(GenericFormat {
            config,
            timestamp_regex,
            filename_pattern,
        })
    }
}

impl LogFormat for GenericFormat {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn extract_timestamp(&self, filename: &str) -> Result<i64, FormatError> {
        let captures = self.timestamp_regex.captures(filename).ok_or_else(|| {
            FormatError::Timestamp {
                filename: filename.to_string(),
                reason: "timestamp regex did not match".to_string(),
            }
        })?;
        let value = captures
            .get(1)
            .ok_or_else(|| FormatError::Timestamp {
                filename: filename.to_string(),
                reason: "timestamp regex has no capture group".to_string(),
            })?
            .as_str();

        match self.config.timestamp_format.as_str() {
            "unix" => value.parse::<i64>().map_err(|e| FormatError::Timestamp {
                filename: filename.to_string(),
                reason: e.to_string(),
            }),
            "unix_ms" => {
                let ms = value.parse::<i64>().map_err(|e| FormatError::Timestamp {
                    filename: filename.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(ms.div_euclid(1000))
            }
            layout => NaiveDateTime::parse_from_str(value, layout)
                .map(|ndt| Utc.from_utc_datetime(&ndt).timestamp())
                .map_err(|e| FormatError::Timestamp {
                    filename: filename.to_string(),
                    reason: format!("layout {layout}: {e}"),
                }),
        }
    }

    fn filter_line<'a>(&self, line: &'a [u8], is_first_line: bool) -> Option<&'a [u8]> {
        if is_first_line && self.config.skip_header_lines > 0 {
            return None;
        }
        if is_blank(line) {
            return None;
        }
        Some(line)
    }

    fn content_type(&self) -> &str {
        &self.config.content_type
    }

    fn detect_by_filename(&self, filename: &str) -> bool {
        self.filename_pattern.matches(filename)
    }

    fn detect_by_content(&self, sample: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(sample) else {
            return false;
        };
        let Some(first) = text.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return false;
        };

        match self.config.content_type.as_str() {
            "application/x-ndjson" | "application/json" => {
                first.starts_with('{') && first.ends_with('}')
            }
            // Plain text is shapeless; require the configured separator and
            // a non-JSON first line so this predicate cannot claim
            // everything ahead of the other descriptors.
            _ => {
                first.contains(self.config.field_separator.as_str())
                    && !first.starts_with('{')
                    && !first.starts_with('[')
            }
        }
    }
}
