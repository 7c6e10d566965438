//! Recurrence expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Terms: *, */N, N, A-B, A-B/N, comma-separated lists of those.
//! Example: "0 8 * * 1-5" = weekdays at 08:00 UTC
//!
//! A parsed expression is pre-expanded into five bitsets so next-occurrence
//! search only does membership tests. Day-of-month and month are not
//! cross-checked here: "* * 31 2 *" parses, and [`RecurrenceRule::next_after`]
//! gives up once its search horizon is exhausted.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use dsched_core::error::ParseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One of the five schedule fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    const ALL: [Field; 5] = [
        Field::Minute,
        Field::Hour,
        Field::DayOfMonth,
        Field::Month,
        Field::DayOfWeek,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day-of-month",
            Field::Month => "month",
            Field::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive legal range. Day-of-week is 0 (Sunday) to 6 (Saturday); 7 is rejected.
    pub fn range(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (0, 6),
        }
    }
}

/// Set of accepted values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldSet(u64);

impl FieldSet {
    pub fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Accepted values in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..64).filter(move |v| self.contains(*v))
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }
}

/// A parsed, normalized recurrence expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl RecurrenceRule {
    /// Parse and validate a five-field expression. No partial acceptance.
    pub fn parse(expression: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ParseError::FieldCountMismatch { found: parts.len() });
        }

        let mut sets = [FieldSet::default(); 5];
        for (slot, (field, text)) in sets.iter_mut().zip(Field::ALL.into_iter().zip(parts)) {
            *slot = parse_field(field, text)?;
        }

        Ok(Self {
            expression: parts_joined(expression),
            minutes: sets[0],
            hours: sets[1],
            days_of_month: sets[2],
            months: sets[3],
            days_of_week: sets[4],
        })
    }

    /// The expression in its normalized textual form.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn field(&self, field: Field) -> FieldSet {
        match field {
            Field::Minute => self.minutes,
            Field::Hour => self.hours,
            Field::DayOfMonth => self.days_of_month,
            Field::Month => self.months,
            Field::DayOfWeek => self.days_of_week,
        }
    }

    /// Whether a calendar date satisfies the day-of-month, month and day-of-week fields.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        self.days_of_month.contains(date.day())
            && self.months.contains(date.month())
            && self.days_of_week.contains(date.weekday().num_days_from_sunday())
    }

    /// Whether an instant (to the minute) satisfies all five fields.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.matches_date(at.date_naive())
            && self.hours.contains(at.hour())
            && self.minutes.contains(at.minute())
    }

    /// Earliest instant strictly after `after` that matches the rule.
    ///
    /// Searches day by day, then minute within the matching day, for at most
    /// `horizon_days` days. Returns `None` when nothing matches in that window,
    /// which is always the case for impossible dates such as February 31.
    pub fn next_after(&self, after: DateTime<Utc>, horizon_days: u32) -> Option<DateTime<Utc>> {
        let start = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let first_day = start.date_naive();
        let mut date = first_day;

        for _ in 0..horizon_days {
            if self.matches_date(date) {
                let (min_hour, min_minute) = if date == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for hour in self.hours.iter().filter(|h| *h >= min_hour) {
                    let minute = self
                        .minutes
                        .iter()
                        .find(|m| hour > min_hour || *m >= min_minute);
                    if let Some(minute) = minute {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            date = date.succ_opt()?;
        }

        None
    }
}

impl std::fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl std::str::FromStr for RecurrenceRule {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RecurrenceRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for RecurrenceRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        Self::parse(&expression).map_err(serde::de::Error::custom)
    }
}

fn parts_joined(expression: &str) -> String {
    expression.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse one field: a comma-separated list of terms.
fn parse_field(field: Field, text: &str) -> Result<FieldSet, ParseError> {
    let mut set = FieldSet::default();
    for term in text.split(',') {
        let (start, end, step) = parse_term(field, term)?;
        for value in (start..=end).step_by(step as usize) {
            set.insert(value);
        }
    }
    Ok(set)
}

/// Parse one term into an inclusive range and step.
fn parse_term(field: Field, term: &str) -> Result<(u32, u32, u32), ParseError> {
    let (min, max) = field.range();

    if let Some((base, step)) = term.split_once('/') {
        if base.is_empty() || step.is_empty() {
            return Err(ParseError::MalformedStep {
                field: field.name(),
                term: term.to_string(),
            });
        }
        let step = match step.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ParseError::InvalidStep {
                    field: field.name(),
                    step: step.to_string(),
                });
            }
        };
        if base == "*" {
            return Ok((min, max, step));
        }
        // A step only applies to a wildcard or an explicit range.
        if !base.contains('-') {
            return Err(ParseError::MalformedStep {
                field: field.name(),
                term: term.to_string(),
            });
        }
        let (start, end) = parse_range(field, base)?;
        return Ok((start, end, step));
    }

    if term == "*" {
        return Ok((min, max, 1));
    }

    if term.contains('-') {
        let (start, end) = parse_range(field, term)?;
        return Ok((start, end, 1));
    }

    let value = parse_value(field, term)?;
    Ok((value, value, 1))
}

fn parse_range(field: Field, text: &str) -> Result<(u32, u32), ParseError> {
    let (start, end) = text.split_once('-').ok_or_else(|| ParseError::InvalidValue {
        field: field.name(),
        term: text.to_string(),
    })?;
    let start = parse_value(field, start)?;
    let end = parse_value(field, end)?;
    if start > end {
        return Err(ParseError::InvalidRange {
            field: field.name(),
            start,
            end,
        });
    }
    Ok((start, end))
}

fn parse_value(field: Field, text: &str) -> Result<u32, ParseError> {
    let (min, max) = field.range();
    let value: u32 = text.parse().map_err(|_| ParseError::InvalidValue {
        field: field.name(),
        term: text.to_string(),
    })?;
    if value < min || value > max {
        return Err(ParseError::OutOfRange {
            field: field.name(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}
