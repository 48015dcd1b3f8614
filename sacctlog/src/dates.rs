use crate::Timestamp;
use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::str::FromStr;

/// A calendar month, ordered chronologically, formatted "YYYY-MM".  Months are the unit of
/// partitioning for rollups, dedupe sets and the backfill cursor.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    pub year: i32,
    pub month: u32, // 1..=12
}

impl Month {
    pub fn new(year: i32, month: u32) -> Month {
        assert!((1..=12).contains(&month));
        Month { year, month }
    }

    /// The month containing the given instant (UTC).

    pub fn containing(t: Timestamp) -> Month {
        Month {
            year: t.year(),
            month: t.month(),
        }
    }

    pub fn of_date(d: NaiveDate) -> Month {
        Month {
            year: d.year(),
            month: d.month(),
        }
    }

    pub fn succ(self) -> Month {
        if self.month == 12 {
            Month {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Month {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn pred(self) -> Month {
        if self.month == 1 {
            Month {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Month {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// "YYYY-MM-01", the inclusive start of the month's fetch window.

    pub fn first_day(self) -> String {
        format!("{self}-01")
    }

    /// Months from `self` through `last`, inclusive at both ends.  Empty if `last < self`.

    pub fn through(self, last: Month) -> Vec<Month> {
        let mut months = Vec::new();
        let mut m = self;
        while m <= last {
            months.push(m);
            m = m.succ();
        }
        months
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Month> {
        let parts = s.split('-').collect::<Vec<&str>>();
        if parts.len() != 2 {
            bail!("Invalid month (expected YYYY-MM): {}", s);
        }
        let year = i32::from_str(parts[0]);
        let month = u32::from_str(parts[1]);
        match (year, month) {
            (Ok(y), Ok(m)) if (1..=12).contains(&m) => Ok(Month::new(y, m)),
            _ => bail!("Invalid month (expected YYYY-MM): {}", s),
        }
    }
}

#[cfg(test)]
use chrono::TimeZone;
#[cfg(test)]
use chrono::Utc;

#[test]
fn test_month_arith() {
    let m = Month::new(2025, 12);
    assert_eq!(m.succ(), Month::new(2026, 1));
    assert_eq!(m.pred(), Month::new(2025, 11));
    assert_eq!(Month::new(2026, 1).pred(), m);
    assert_eq!(m.to_string(), "2025-12");
    assert_eq!(m.first_day(), "2025-12-01");
}

#[test]
fn test_month_parse() {
    assert_eq!("2025-08".parse::<Month>().unwrap(), Month::new(2025, 8));
    assert!("2025-13".parse::<Month>().is_err());
    assert!("2025".parse::<Month>().is_err());
    assert!("2025-08-01".parse::<Month>().is_err());
}

#[test]
fn test_month_containing() {
    let t = Utc.with_ymd_and_hms(2025, 8, 31, 23, 59, 59).unwrap();
    assert_eq!(Month::containing(t), Month::new(2025, 8));
}

#[test]
fn test_month_through() {
    let from = Month::new(2025, 11);
    let to = Month::new(2026, 2);
    assert_eq!(
        from.through(to),
        vec![
            Month::new(2025, 11),
            Month::new(2025, 12),
            Month::new(2026, 1),
            Month::new(2026, 2)
        ]
    );
    assert!(to.through(from).is_empty());
    assert_eq!(from.through(from), vec![from]);
}
