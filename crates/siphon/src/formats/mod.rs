//! Log format descriptors and the detection registry.
//!
//! A format descriptor knows three things about the objects it covers: how
//! to pull an epoch timestamp out of a filename, which lines of a file are
//! real log lines (header rows and blank lines are not), and the
//! Content-Type the ingestion endpoint should receive. Descriptors also
//! carry two conservative detection predicates used only in auto mode.
//!
//! The registry keeps descriptors in registration order: user-defined
//! formats first, then the built-ins, so a user format can shadow built-in
//! detection. `detect` tries filename predicates through the whole list
//! before it ever looks at content — a filename match always wins.

mod cisco_umbrella;
mod generic;
mod zscaler;

use std::sync::Arc;

use thiserror::Error;

use crate::config::FormatConfig;

pub use cisco_umbrella::CiscoUmbrellaFormat;
pub use generic::GenericFormat;
pub use zscaler::ZscalerFormat;

/// Fallback descriptor when nothing else is configured or detected.
const FALLBACK_FORMAT: &str = "zscaler";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unknown log format: {0}")]
    UnknownFormat(String),

    #[error("invalid timestamp regex for format {name}: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid filename pattern for format {name}: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to parse timestamp from {filename}: {reason}")]
    Timestamp { filename: String, reason: String },
}

/// Behavior contract of a log format.
///
/// All methods are pure over their inputs; descriptors are immutable after
/// registry construction and shared across workers.
pub trait LogFormat: Send + Sync {
    /// Format name, e.g. `zscaler`.
    fn name(&self) -> &str;

    /// Extracts epoch seconds from an object basename.
    fn extract_timestamp(&self, filename: &str) -> Result<i64, FormatError>;

    /// Filters a single line. Returns `None` for lines that must not be
    /// forwarded (blank lines, header rows), otherwise the line unchanged.
    fn filter_line<'a>(&self, line: &'a [u8], is_first_line: bool) -> Option<&'a [u8]>;

    /// Content-Type for HTTP dispatch of this format's lines.
    fn content_type(&self) -> &str;

    /// Filename-shape predicate used during auto-detection.
    fn detect_by_filename(&self, filename: &str) -> bool;

    /// Content-shape predicate used during auto-detection, only when no
    /// filename predicate matched.
    fn detect_by_content(&self, sample: &[u8]) -> bool;
}

/// True for lines that are empty or whitespace-only; no descriptor forwards
/// those.
pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

/// Ordered collection of descriptors with name lookup and auto-detection.
pub struct Registry {
    formats: Vec<Arc<dyn LogFormat>>,
    default_name: String,
}

impl Registry {
    /// Registry with only the built-in descriptors.
    pub fn new() -> Registry {
        Registry {
            formats: vec![
                Arc::new(ZscalerFormat),
                Arc::new(CiscoUmbrellaFormat),
            ],
            default_name: FALLBACK_FORMAT.to_string(),
        }
    }

    /// Registry with user-defined descriptors registered ahead of the
    /// built-ins. `default_name` designates the descriptor returned when
    /// detection fails; `auto` (or empty) falls back to the built-in
    /// default.
    pub fn from_config(
        formats: &[FormatConfig],
        default_name: &str,
    ) -> Result<Registry, FormatError> {
        let mut registered: Vec<Arc<dyn LogFormat>> = Vec::with_capacity(formats.len() + 2);
        for cfg in formats {
            registered.push(Arc::new(GenericFormat::new(cfg.clone())?));
        }
        registered.push(Arc::new(ZscalerFormat));
        registered.push(Arc::new(CiscoUmbrellaFormat));

        let default_name = if default_name.is_empty() || default_name == "auto" {
            FALLBACK_FORMAT.to_string()
        } else {
            default_name.to_string()
        };

        let registry = Registry {
            formats: registered,
            default_name,
        };
        // The default must resolve; surface a bad name at startup.
        registry.get(registry.default_name.as_str())?;
        Ok(registry)
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LogFormat>, FormatError> {
        self.formats
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .ok_or_else(|| FormatError::UnknownFormat(name.to_string()))
    }

    /// The descriptor used when detection fails.
    pub fn default_format(&self) -> Arc<dyn LogFormat> {
        // Presence is checked at construction.
        self.formats
            .iter()
            .find(|f| f.name() == self.default_name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.formats[0]))
    }

    /// Detects the format of an object. Filename predicates are consulted
    /// for every registered descriptor before any content predicate runs;
    /// ties go to registration order. Falls back to the default descriptor.
    pub fn detect(&self, filename: &str, sample: Option<&[u8]>) -> Arc<dyn LogFormat> {
        if let Some(format) = self
            .formats
            .iter()
            .find(|f| f.detect_by_filename(filename))
        {
            return Arc::clone(format);
        }

        if let Some(sample) = sample {
            if let Some(format) = self.formats.iter().find(|f| f.detect_by_content(sample)) {
                return Arc::clone(format);
            }
        }

        self.default_format()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_format(name: &str) -> FormatConfig {
        FormatConfig {
            name: name.to_string(),
            filename_pattern: "*.custom.gz".to_string(),
            timestamp_regex: r"^(\d+)\.custom\.gz$".to_string(),
            timestamp_format: "unix".to_string(),
            content_type: "application/x-ndjson".to_string(),
            skip_header_lines: 0,
            field_separator: ",".to_string(),
        }
    }

    #[test]
    fn builtin_lookup_by_name() {
        let registry = Registry::new();
        assert_eq!(registry.get("zscaler").unwrap().name(), "zscaler");
        assert_eq!(
            registry.get("cisco_umbrella").unwrap().name(),
            "cisco_umbrella"
        );
    }

    #[test]
    fn unknown_name_errors() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(FormatError::UnknownFormat(_))
        ));
    }

    #[test]
    fn detect_by_filename_zscaler() {
        let registry = Registry::new();
        let format = registry.detect("1760305292_56442_130_1.gz", None);
        assert_eq!(format.name(), "zscaler");
    }

    #[test]
    fn detect_by_filename_cisco() {
        let registry = Registry::new();
        let format = registry.detect("2025-01-15-10-30-0001.csv.gz", None);
        assert_eq!(format.name(), "cisco_umbrella");
    }

    #[test]
    fn detect_falls_back_to_content() {
        let registry = Registry::new();
        let sample = br#"{"sourcetype":"zscalernss-web","event":{}}"#;
        let format = registry.detect("opaque-name", Some(sample));
        assert_eq!(format.name(), "zscaler");
    }

    #[test]
    fn detect_falls_back_to_default() {
        let registry = Registry::new();
        let format = registry.detect("opaque-name", None);
        assert_eq!(format.name(), "zscaler");
    }

    #[test]
    fn user_formats_precede_builtins() {
        // A user format whose filename predicate also matches zscaler-shaped
        // names must win detection.
        let cfg = FormatConfig {
            filename_pattern: "*.gz".to_string(),
            ..custom_format("mine")
        };
        let registry = Registry::from_config(&[cfg], "auto").unwrap();
        let format = registry.detect("1760305292_56442_130_1.gz", None);
        assert_eq!(format.name(), "mine");
    }

    #[test]
    fn filename_match_beats_content_match() {
        // Sample looks like JSON (zscaler content predicate matches), but
        // the cisco filename predicate must decide first.
        let registry = Registry::new();
        let sample = br#"{"k":"v"}"#;
        let format = registry.detect("2025-01-15-10-30-0001.csv.gz", Some(sample));
        assert_eq!(format.name(), "cisco_umbrella");
    }

    #[test]
    fn configured_default_used_on_detection_miss() {
        let registry = Registry::from_config(&[], "cisco_umbrella").unwrap();
        let format = registry.detect("opaque-name", None);
        assert_eq!(format.name(), "cisco_umbrella");
    }

    #[test]
    fn bad_default_name_rejected_at_construction() {
        assert!(Registry::from_config(&[], "missing").is_err());
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(b""));
        assert!(is_blank(b"   \t"));
        assert!(!is_blank(b" x "));
    }
}
