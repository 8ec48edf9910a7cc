//! Zscaler NSS web logs: JSON lines, one event per line.
//!
//! Filenames look like `<unix>_<feed>_<node>_<seq>[.gz]`; the leading
//! field is the epoch-seconds timestamp the scanner windows on.

use super::{is_blank, FormatError, LogFormat};

pub struct ZscalerFormat;

impl LogFormat for ZscalerFormat {
    fn name(&self) -> &str {
        "zscaler"
    }

    fn extract_timestamp(&self, filename: &str) -> Result<i64, FormatError> {
        let base = filename.strip_suffix(".gz").unwrap_or(filename);
        let first = base.split('_').next().unwrap_or_default();
        first.parse::<i64>().map_err(|e| FormatError::Timestamp {
            filename: filename.to_string(),
            reason: e.to_string(),
        })
    }

    fn filter_line<'a>(&self, line: &'a [u8], _is_first_line: bool) -> Option<&'a [u8]> {
        if is_blank(line) {
            None
        } else {
            Some(line)
        }
    }

    fn content_type(&self) -> &str {
        "application/x-ndjson"
    }

    fn detect_by_filename(&self, filename: &str) -> bool {
        // <unix>_<feed>_<node>_<seq>: at least four underscore-separated
        // fields, the first numeric.
        let base = filename.strip_suffix(".gz").unwrap_or(filename);
        let parts: Vec<&str> = base.split('_').collect();
        parts.len() >= 4 && parts[0].parse::<i64>().is_ok()
    }

    fn detect_by_content(&self, sample: &[u8]) -> bool {
        // First non-blank line must be a JSON object.
        let Ok(text) = std::str::from_utf8(sample) else {
            return false;
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return line.starts_with('{')
                && line.ends_with('}')
                && serde_json::from_str::<serde_json::Value>(line).is_ok();
        }
        false
    }
}
