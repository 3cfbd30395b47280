//! Window bucket arithmetic.
//!
//! The Redis limiter script computes the same boundaries server-side from `TIME`;
//! this module is the in-process rendition used by the local provider.

use chrono::{DateTime, Datelike, NaiveDate};

use crate::{Category, WindowSeconds};

/// Concrete time slot of a granularity, in seconds since the Unix epoch.
///
/// `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowBucket {
    /// First second of the bucket.
    pub start: i64,
    /// First second after the bucket.
    pub end: i64,
}

impl WindowBucket {
    /// Bucket of `category` containing `now_secs`.
    ///
    /// `custom` is the window length used for [`Category::Custom`]; it is ignored
    /// for every other category. Returns `None` for a custom category without a
    /// length or for instants chrono cannot represent.
    pub fn at(category: Category, now_secs: i64, custom: Option<WindowSeconds>) -> Option<Self> {
        match category {
            Category::Second | Category::Minute | Category::Hour | Category::Day => {
                let length = category.fixed_length_seconds()? as i64;
                Some(Self::aligned(now_secs, length))
            }
            Category::Custom => {
                let length = i64::try_from(*custom?).ok()?;
                Some(Self::aligned(now_secs, length))
            }
            Category::Month => {
                let date = DateTime::from_timestamp(now_secs, 0)?.date_naive();
                let (next_year, next_month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };

                Some(Self {
                    start: month_start(date.year(), date.month())?,
                    end: month_start(next_year, next_month)?,
                })
            }
            Category::Year => {
                let year = DateTime::from_timestamp(now_secs, 0)?.year();

                Some(Self {
                    start: month_start(year, 1)?,
                    end: month_start(year + 1, 1)?,
                })
            }
        }
    }

    /// Whether `now_secs` falls inside this bucket.
    pub fn contains(&self, now_secs: i64) -> bool {
        self.start <= now_secs && now_secs < self.end
    }

    /// Bucket length in seconds.
    pub fn len_seconds(&self) -> i64 {
        self.end - self.start
    }

    fn aligned(now_secs: i64, length: i64) -> Self {
        let start = now_secs - now_secs.rem_euclid(length);

        Self {
            start,
            end: start + length,
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<i64> {
    Some(
        NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
            .timestamp(),
    )
}
