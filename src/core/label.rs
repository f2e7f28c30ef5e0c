use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Length of a filing period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Month,
    Quarter,
    Year,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::Month => "monthly",
            Granularity::Quarter => "quarterly",
            Granularity::Year => "yearly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Span {
    Year,
    Quarter(u32),
    Month(u32),
}

/// Filing period label: `2024`, `2024-Q3` or `2024-07`.
///
/// Labels order by start date, then by granularity, so a chain of labels of
/// one granularity sorts chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodLabel {
    year: i32,
    span: Span,
}

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid period label '{0}', expected YYYY, YYYY-Qn or YYYY-MM")]
pub struct LabelError(String);

impl PeriodLabel {
    pub fn year(year: i32) -> Option<Self> {
        (MIN_YEAR..=MAX_YEAR).contains(&year).then_some(PeriodLabel {
            year,
            span: Span::Year,
        })
    }

    pub fn quarter(year: i32, quarter: u32) -> Option<Self> {
        let label = Self::year(year)?;
        (1..=4).contains(&quarter).then_some(PeriodLabel {
            span: Span::Quarter(quarter),
            ..label
        })
    }

    pub fn month(year: i32, month: u32) -> Option<Self> {
        let label = Self::year(year)?;
        (1..=12).contains(&month).then_some(PeriodLabel {
            span: Span::Month(month),
            ..label
        })
    }

    pub fn granularity(&self) -> Granularity {
        match self.span {
            Span::Year => Granularity::Year,
            Span::Quarter(_) => Granularity::Quarter,
            Span::Month(_) => Granularity::Month,
        }
    }

    fn first_month(&self) -> u32 {
        match self.span {
            Span::Year => 1,
            Span::Quarter(q) => (q - 1) * 3 + 1,
            Span::Month(m) => m,
        }
    }

    fn months(&self) -> u32 {
        match self.span {
            Span::Year => 12,
            Span::Quarter(_) => 3,
            Span::Month(_) => 1,
        }
    }

    /// First day of the period
    pub fn start_date(&self) -> NaiveDate {
        // year and month are range checked on construction
        NaiveDate::from_ymd_opt(self.year, self.first_month(), 1).unwrap_or_default()
    }

    /// Last day of the period
    pub fn end_date(&self) -> NaiveDate {
        self.start_date()
            .checked_add_months(Months::new(self.months()))
            .and_then(|d| d.checked_sub_days(Days::new(1)))
            .unwrap_or_default()
    }

    /// The label of the same granularity immediately after this one.
    pub fn next(&self) -> Option<Self> {
        let next_start = self.end_date().checked_add_days(Days::new(1))?;
        let (year, month) = (next_start.year(), next_start.month());
        match self.span {
            Span::Year => Self::year(year),
            Span::Quarter(_) => Self::quarter(year, (month - 1) / 3 + 1),
            Span::Month(_) => Self::month(year, month),
        }
    }
}

impl Ord for PeriodLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_date()
            .cmp(&other.start_date())
            .then_with(|| self.granularity().cmp(&other.granularity()))
    }
}

impl PartialOrd for PeriodLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeriodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Span::Year => write!(f, "{}", self.year),
            Span::Quarter(q) => write!(f, "{}-Q{}", self.year, q),
            Span::Month(m) => write!(f, "{}-{:02}", self.year, m),
        }
    }
}

impl FromStr for PeriodLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LabelError(s.to_string());
        let trimmed = s.trim();
        let (year, rest) = match trimmed.split_once('-') {
            Some((year, rest)) => (year, Some(rest)),
            None => (trimmed, None),
        };
        if year.len() != 4 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let label = match rest {
            None => Self::year(year),
            Some(q) if q.starts_with(['Q', 'q']) => {
                let quarter = q[1..].parse().map_err(|_| invalid())?;
                Self::quarter(year, quarter)
            }
            Some(m) if m.len() == 2 => {
                let month = m.parse().map_err(|_| invalid())?;
                Self::month(year, month)
            }
            Some(_) => None,
        };
        label.ok_or_else(invalid)
    }
}

impl TryFrom<String> for PeriodLabel {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodLabel> for String {
    fn from(label: PeriodLabel) -> Self {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> PeriodLabel {
        s.parse().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parse_and_display() {
        for s in ["2024", "2024-Q1", "2024-Q4", "2024-01", "2024-12"] {
            assert_eq!(label(s).to_string(), s);
        }
        assert_eq!(label("2024-q2").to_string(), "2024-Q2");
        assert_eq!(label(" 2024-07 ").to_string(), "2024-07");
    }

    #[test]
    fn reject_malformed() {
        for s in ["", "24", "2024-Q5", "2024-Q0", "2024-13", "2024-00", "2024-7", "2024-H1", "abcd"] {
            assert!(s.parse::<PeriodLabel>().is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn period_bounds() {
        assert_eq!(label("2024").start_date(), date(2024, 1, 1));
        assert_eq!(label("2024").end_date(), date(2024, 12, 31));
        assert_eq!(label("2024-Q3").start_date(), date(2024, 7, 1));
        assert_eq!(label("2024-Q3").end_date(), date(2024, 9, 30));
        assert_eq!(label("2024-02").end_date(), date(2024, 2, 29));
        assert_eq!(label("2023-02").end_date(), date(2023, 2, 28));
    }

    #[test]
    fn ordering() {
        let mut labels = vec![label("2024-Q3"), label("2023-Q4"), label("2024-Q1")];
        labels.sort();
        let sorted: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        assert_eq!(sorted, ["2023-Q4", "2024-Q1", "2024-Q3"]);
        assert!(label("2024-01") < label("2024-Q1"));
        assert!(label("2024-Q1") < label("2024"));
        assert!(label("2024") < label("2024-02"));
    }

    #[test]
    fn next_label() {
        assert_eq!(label("2024-Q4").next(), Some(label("2025-Q1")));
        assert_eq!(label("2024-12").next(), Some(label("2025-01")));
        assert_eq!(label("2024").next(), Some(label("2025")));
        assert_eq!(label("9999").next(), None);
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&label("2024-Q2")).unwrap();
        assert_eq!(json, "\"2024-Q2\"");
        let back: PeriodLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, label("2024-Q2"));
        assert!(serde_json::from_str::<PeriodLabel>("\"2024-Q9\"").is_err());
    }
}
