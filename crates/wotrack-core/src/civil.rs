//! Civil-date rendering in the single timezone the system operates in.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CIVIL_TZ: Tz = chrono_tz::America::Sao_Paulo;
pub const CIVIL_DATE_FORMAT: &str = "%d/%m/%Y";
/// Spreadsheet placeholder for "no completion date".
pub const NO_DATE_MARKER: &str = "-";

static CIVIL_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}/\d{2}/\d{4}$").expect("civil date pattern compiles"));

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Canonical `dd/mm/yyyy` string for one calendar day in the civil timezone.
///
/// Two `CivilDate`s are the same day exactly when their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CivilDate(String);

impl CivilDate {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CivilDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for CivilDate {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CivilDate {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilCalendar {
    tz: Tz,
}

impl Default for CivilCalendar {
    fn default() -> Self {
        Self::new(DEFAULT_CIVIL_TZ)
    }
}

impl CivilCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Calendar for an IANA zone name such as `America/Sao_Paulo`.
    pub fn from_tz_name(name: &str) -> Option<Self> {
        name.trim().parse::<Tz>().ok().map(Self::new)
    }

    /// `WOTRACK_CIVIL_TZ`, falling back to [`DEFAULT_CIVIL_TZ`] when unset or unknown.
    pub fn from_env() -> Self {
        std::env::var("WOTRACK_CIVIL_TZ")
            .ok()
            .and_then(|name| Self::from_tz_name(&name))
            .unwrap_or_default()
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn civil_date_of(&self, instant: DateTime<Utc>) -> CivilDate {
        CivilDate(
            instant
                .with_timezone(&self.tz)
                .format(CIVIL_DATE_FORMAT)
                .to_string(),
        )
    }

    pub fn today(&self, now: DateTime<Utc>) -> CivilDate {
        self.civil_date_of(now)
    }

    /// Normalize a date-ish value into its canonical civil date.
    ///
    /// Literals already shaped like `dd/mm/yyyy` are passed through untouched;
    /// everything else is parsed as an instant (or a bare ISO day) and rendered
    /// in the civil timezone. Returns `None` for blanks, the `-` marker, and
    /// unparseable input.
    pub fn normalize(&self, text: &str) -> Option<CivilDate> {
        let text = text.trim();
        if text.is_empty() || text == NO_DATE_MARKER {
            return None;
        }
        if CIVIL_LITERAL.is_match(text) {
            return Some(CivilDate(text.to_string()));
        }
        if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
            return Some(self.civil_date_of(instant.with_timezone(&Utc)));
        }
        // Offset-less timestamps are stored in UTC.
        for format in NAIVE_TIMESTAMP_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Some(self.civil_date_of(Utc.from_utc_datetime(&naive)));
            }
        }
        // A bare ISO day is already a calendar day; no zone conversion.
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(|day| CivilDate(day.format(CIVIL_DATE_FORMAT).to_string()))
    }

    pub fn is_same_civil_day(&self, a: &str, b: &str) -> bool {
        match (self.normalize(a), self.normalize(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
