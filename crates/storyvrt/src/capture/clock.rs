use anyhow::{Context, Result};
use chrono::DateTime;

use super::scripts;
use crate::config::{DEFAULT_FIXED_DATE, FixDate};

/// Epoch milliseconds of 2000-01-01T00:00:00Z. Numeric `fix_date` values
/// below this are epoch seconds, not milliseconds.
const YEAR_2000_MS: i64 = 946_684_800_000;

/// Pins the page's wall clock by replacing `Date` before any page script
/// runs.
pub struct ClockFixer {
    pinned_ms: Option<i64>,
}

impl ClockFixer {
    pub fn from_config(fix_date: &FixDate) -> Result<Self> {
        let pinned_ms = match fix_date {
            FixDate::Enabled(false) => None,
            FixDate::Enabled(true) => Some(parse_iso(DEFAULT_FIXED_DATE)?),
            FixDate::Iso(iso) => Some(parse_iso(iso)?),
            FixDate::Epoch(n) => Some(epoch_to_ms(*n)),
        };
        Ok(Self { pinned_ms })
    }

    /// The pinned timestamp in epoch milliseconds, when enabled.
    pub fn pinned_ms(&self) -> Option<i64> {
        self.pinned_ms
    }

    /// The init script to register on the page, when enabled.
    pub fn init_script(&self) -> Option<String> {
        self.pinned_ms
            .map(|ms| scripts::FIX_DATE_JS_TEMPLATE.replace("__PINNED_TS__", &ms.to_string()))
    }
}

fn parse_iso(iso: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_millis())
        .with_context(|| format!("Invalid fix_date '{iso}': expected ISO-8601"))
}

fn epoch_to_ms(n: i64) -> i64 {
    if n.abs() < YEAR_2000_MS {
        n * 1000
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_produces_no_script() {
        let fixer = ClockFixer::from_config(&FixDate::Enabled(false)).unwrap();
        assert_eq!(fixer.pinned_ms(), None);
        assert!(fixer.init_script().is_none());
    }

    #[test]
    fn default_date_is_2024_02_02() {
        let fixer = ClockFixer::from_config(&FixDate::Enabled(true)).unwrap();
        assert_eq!(fixer.pinned_ms(), Some(1_706_868_000_000));
    }

    #[test]
    fn iso_string_parsed_to_millis() {
        let fixer =
            ClockFixer::from_config(&FixDate::Iso("2020-01-01T00:00:00Z".into())).unwrap();
        assert_eq!(fixer.pinned_ms(), Some(1_577_836_800_000));
    }

    #[test]
    fn invalid_iso_is_an_error() {
        assert!(ClockFixer::from_config(&FixDate::Iso("yesterday".into())).is_err());
    }

    #[test]
    fn small_epoch_values_are_seconds() {
        let fixer = ClockFixer::from_config(&FixDate::Epoch(1_700_000_000)).unwrap();
        assert_eq!(fixer.pinned_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn large_epoch_values_are_milliseconds() {
        let fixer = ClockFixer::from_config(&FixDate::Epoch(1_700_000_000_000)).unwrap();
        assert_eq!(fixer.pinned_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn script_embeds_the_pinned_timestamp() {
        let fixer = ClockFixer::from_config(&FixDate::Epoch(1_700_000_000)).unwrap();
        let script = fixer.init_script().unwrap();
        assert!(script.contains("1700000000000"));
        assert!(!script.contains("__PINNED_TS__"));
    }
}
