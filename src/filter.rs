//! Image filter (distilled spec §4.7).
//!
//! Modeled as a closed variant rather than a trait object, per the
//! "dynamic dispatch" redesign note: the set of filter kinds is fixed and
//! known at configuration-parse time.

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum ImageFilter {
    AcceptAll,
    Regex(Regex),
}

impl ImageFilter {
    pub fn should_backup(&self, image_name: &str) -> bool {
        match self {
            ImageFilter::AcceptAll => true,
            ImageFilter::Regex(re) => re.is_match(image_name),
        }
    }
}

impl Default for ImageFilter {
    fn default() -> Self {
        ImageFilter::AcceptAll
    }
}

/// On-disk representation of an [`ImageFilter`] (§6 configuration).
#[derive(Debug, Deserialize, Default)]
pub struct ImageFilterConfig {
    regex: Option<String>,
}

impl ImageFilterConfig {
    pub fn build(&self) -> Result<ImageFilter, ConfigError> {
        match &self.regex {
            None => Ok(ImageFilter::AcceptAll),
            Some(pattern) => {
                // Python's `re.match` anchors at the start without requiring a
                // full-string match; `regex`'s `is_match` searches anywhere,
                // so anchor explicitly to reproduce that semantics.
                let anchored = format!("^(?:{pattern})");
                let re =
                    Regex::new(&anchored).map_err(|source| ConfigError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })?;
                Ok(ImageFilter::Regex(re))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_all_matches_everything() {
        let filter = ImageFilter::AcceptAll;
        assert!(filter.should_backup("anything"));
    }

    #[test]
    fn regex_matches_at_start_not_full_string() {
        let cfg = ImageFilterConfig {
            regex: Some("vm-".to_string()),
        };
        let filter = cfg.build().unwrap();
        assert!(filter.should_backup("vm-101"));
        assert!(!filter.should_backup("ct-101"));
        // Anchored at start, but not a full-string match: trailing
        // characters after the pattern don't prevent a match.
        assert!(filter.should_backup("vm-101-disk-0"));
        assert!(!filter.should_backup("template-vm-101"));
    }
}
