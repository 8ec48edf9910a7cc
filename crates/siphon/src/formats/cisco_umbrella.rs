//! Cisco Umbrella DNS logs: CSV with one header row per file.
//!
//! Filenames encode the collection minute: `YYYY-MM-DD-HH-MM-<suffix>.csv[.gz]`.

use chrono::{TimeZone, Utc};

use super::{is_blank, FormatError, LogFormat};

const HEADER_KEYWORDS: [&str; 5] = ["timestamp", "domain", "action", "identity", "categories"];

pub struct CiscoUmbrellaFormat;

impl CiscoUmbrellaFormat {
    fn timestamp_error(filename: &str, reason: &str) -> FormatError {
        FormatError::Timestamp {
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl LogFormat for CiscoUmbrellaFormat {
    fn name(&self) -> &str {
        "cisco_umbrella"
    }

    fn extract_timestamp(&self, filename: &str) -> Result<i64, FormatError> {
        let base = filename
            .strip_suffix(".csv.gz")
            .or_else(|| filename.strip_suffix(".gz"))
            .or_else(|| filename.strip_suffix(".csv"))
            .unwrap_or(filename);

        let parts: Vec<&str> = base.split('-').collect();
        if parts.len() < 5 {
            return Err(Self::timestamp_error(filename, "expected YYYY-MM-DD-HH-MM"));
        }

        let mut fields = [0i64; 5];
        for (i, part) in parts.iter().take(5).enumerate() {
            fields[i] = part
                .parse::<i64>()
                .map_err(|e| Self::timestamp_error(filename, &e.to_string()))?;
        }

        let [year, month, day, hour, minute] = fields;
        Utc.with_ymd_and_hms(
            year as i32,
            month as u32,
            day as u32,
            hour as u32,
            minute as u32,
            0,
        )
        .single()
        .map(|t| t.timestamp())
        .ok_or_else(|| Self::timestamp_error(filename, "not a valid calendar time"))
    }

    fn filter_line<'a>(&self, line: &'a [u8], is_first_line: bool) -> Option<&'a [u8]> {
        // First line of every file is the CSV header.
        if is_first_line || is_blank(line) {
            None
        } else {
            Some(line)
        }
    }

    fn content_type(&self) -> &str {
        "text/plain"
    }

    fn detect_by_filename(&self, filename: &str) -> bool {
        let Some(base) = filename
            .strip_suffix(".csv.gz")
            .or_else(|| filename.strip_suffix(".csv"))
        else {
            return false;
        };

        // YYYY-MM-DD-HH-MM-<suffix>: six dash-separated fields, the first
        // five numeric.
        let parts: Vec<&str> = base.split('-').collect();
        parts.len() >= 6 && parts.iter().take(5).all(|p| p.parse::<i64>().is_ok())
    }

    fn detect_by_content(&self, sample: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(sample) else {
            return false;
        };
        let mut lines = text.lines();
        let (Some(header), Some(data)) = (lines.next(), lines.next()) else {
            return false;
        };

        let header = header.trim();
        if !header.contains(',') || header.starts_with('{') || header.starts_with('[') {
            return false;
        }
        let data = data.trim();
        if !data.contains(',') || data.starts_with('{') || data.starts_with('[') {
            return false;
        }

        let header_lower = header.to_lowercase();
        let matches = HEADER_KEYWORDS
            .iter()
            .filter(|k| header_lower.contains(*k))
            .count();
        matches >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_calendar_timestamp() {
        let f = CiscoUmbrellaFormat;
        let ts = f.extract_timestamp("2025-01-15-10-30-0001.csv.gz").unwrap();
        let expect = Utc
            .with_ymd_and_hms(2025, 1, 15, 10, 30, 0)
            .single()
            .unwrap()
            .timestamp();
        assert_eq!(ts, expect);
    }

    #[test]
    fn accepts_uncompressed_csv() {
        let f = CiscoUmbrellaFormat;
        assert!(f.extract_timestamp("2025-01-15-10-30-0001.csv").is_ok());
    }

    #[test]
    fn rejects_malformed_names() {
        let f = CiscoUmbrellaFormat;
        assert!(f.extract_timestamp("2025-01-15.csv.gz").is_err());
        assert!(f.extract_timestamp("2025-13-40-99-99-0001.csv.gz").is_err());
        assert!(f.extract_timestamp("a-b-c-d-e.csv.gz").is_err());
    }

    #[test]
    fn header_row_dropped_data_kept() {
        let f = CiscoUmbrellaFormat;
        assert_eq!(f.filter_line(b"timestamp,domain,action", true), None);
        let line = b"2025-01-15 10:30:00,example.com,allowed";
        assert_eq!(f.filter_line(line, false), Some(&line[..]));
    }

    #[test]
    fn blank_lines_dropped() {
        let f = CiscoUmbrellaFormat;
        assert_eq!(f.filter_line(b"", false), None);
        assert_eq!(f.filter_line(b"   ", false), None);
    }

    #[test]
    fn content_type_is_plain_text() {
        assert_eq!(CiscoUmbrellaFormat.content_type(), "text/plain");
    }

    #[test]
    fn filename_detection() {
        let f = CiscoUmbrellaFormat;
        assert!(f.detect_by_filename("2025-01-15-10-30-0001.csv.gz"));
        assert!(f.detect_by_filename("2025-01-15-10-30-0001.csv"));
        assert!(!f.detect_by_filename("2025-01-15-10-30-0001.json"));
        assert!(!f.detect_by_filename("1760305292_56442_130_1.gz"));
    }

    #[test]
    fn content_detection_needs_csv_header_keywords() {
        let f = CiscoUmbrellaFormat;
        let sample = b"Timestamp,Identity,Domain,Action\n2025-01-15,alice,example.com,allowed\n";
        assert!(f.detect_by_content(sample));
        assert!(!f.detect_by_content(b"{\"a\":1}\n{\"b\":2}\n"));
        assert!(!f.detect_by_content(b"just one line\n"));
        assert!(!f.detect_by_content(b"col1,col2\nv1,v2\n"));
    }
}
