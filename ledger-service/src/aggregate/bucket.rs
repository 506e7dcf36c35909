//! Local calendar buckets. Day and month boundaries are taken in a fixed UTC
//! offset, not in UTC.

use ledger_client::domain::Granularity;
use time::{macros::format_description, Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Day(Date),
    /// Holds the first day of the month.
    Month(Date),
}

fn first_of_month(date: Date) -> Date {
    date - Duration::days(i64::from(date.day()) - 1)
}

impl Bucket {
    pub fn containing(ts: OffsetDateTime, granularity: Granularity, offset: UtcOffset) -> Self {
        let local = ts.to_offset(offset).date();
        match granularity {
            Granularity::Daily => Self::Day(local),
            Granularity::Monthly => Self::Month(first_of_month(local)),
        }
    }

    pub fn day(date: Date) -> Self {
        Self::Day(date)
    }

    pub fn month_of(date: Date) -> Self {
        Self::Month(first_of_month(date))
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Day(_) => Granularity::Daily,
            Self::Month(_) => Granularity::Monthly,
        }
    }

    /// `YYYY-MM-DD` for days, `YYYY-MM` for months.
    pub fn label(&self) -> String {
        match self {
            Self::Day(d) => format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day()),
            Self::Month(d) => format!("{:04}-{:02}", d.year(), u8::from(d.month())),
        }
    }

    pub fn parse(label: &str, granularity: Granularity) -> Option<Self> {
        match granularity {
            Granularity::Daily => Date::parse(label, format_description!("[year]-[month]-[day]"))
                .ok()
                .map(Self::Day),
            Granularity::Monthly => Date::parse(
                &format!("{label}-01"),
                format_description!("[year]-[month]-[day]"),
            )
            .ok()
            .map(Self::Month),
        }
    }

    fn first_day(&self) -> Date {
        match self {
            Self::Day(d) | Self::Month(d) => *d,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            Self::Day(d) => Self::Day(d.saturating_add(Duration::DAY)),
            Self::Month(d) => {
                let days = time::util::days_in_year_month(d.year(), d.month());
                Self::Month(d.saturating_add(Duration::days(i64::from(days))))
            }
        }
    }

    /// `[start, end)` of the bucket as instants.
    pub fn bounds(&self, offset: UtcOffset) -> (OffsetDateTime, OffsetDateTime) {
        let at_midnight = |d: Date| PrimitiveDateTime::new(d, Time::MIDNIGHT).assume_offset(offset);
        (at_midnight(self.first_day()), at_midnight(self.next().first_day()))
    }

    /// Every bucket of `granularity` overlapping `[from, to)`.
    pub fn covering(
        from: OffsetDateTime,
        to: OffsetDateTime,
        granularity: Granularity,
        offset: UtcOffset,
    ) -> Vec<Self> {
        let mut out = Vec::new();
        if to <= from {
            return out;
        }
        let mut bucket = Self::containing(from, granularity, offset);
        while bucket.bounds(offset).0 < to {
            out.push(bucket);
            bucket = bucket.next();
        }
        out
    }

    /// Days of a month bucket; a day bucket yields itself.
    pub fn days(&self) -> Vec<Self> {
        match self {
            Self::Day(_) => vec![*self],
            Self::Month(first) => {
                let end = self.next().first_day();
                let mut out = Vec::new();
                let mut d = *first;
                while d < end {
                    out.push(Self::Day(d));
                    d = d.saturating_add(Duration::DAY);
                }
                out
            }
        }
    }

    pub fn month(&self) -> Self {
        Self::month_of(self.first_day())
    }
}
