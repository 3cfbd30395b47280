use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use crate::TollgateError;

/// Separator used to join caller-supplied key segments into one [`LimiterKey`].
pub const KEY_SEPARATOR: char = '/';

/// Maximum length in bytes of a joined [`LimiterKey`].
pub const MAX_KEY_LEN: usize = 512;

/// Longest accepted [`WindowSeconds`].
///
/// Half of the largest millisecond timestamp Redis stores as an expiry, so that
/// `now + length` still converts to milliseconds without overflow.
pub const MAX_WINDOW_SECONDS: u64 = (i64::MAX / 1000 / 2) as u64;

/// Field suffix used in the rule hash to store the length of a custom window.
#[cfg_attr(not(feature = "redis-tokio"), allow(dead_code))]
pub(crate) const CUSTOM_WINDOW_FIELD: &str = "CUSTOM_window";

/// Window class over which a quota is independently enforced.
///
/// The declaration order is the evaluation order of a rule: shorter windows are
/// checked first, [`Category::Custom`] last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// One wall-clock second.
    Second,
    /// One wall-clock minute.
    Minute,
    /// One wall-clock hour.
    Hour,
    /// One UTC day.
    Day,
    /// One UTC calendar month.
    Month,
    /// One UTC calendar year.
    Year,
    /// A window of explicit length, see [`WindowSeconds`].
    Custom,
}

impl Category {
    /// All categories in evaluation order.
    pub const ALL: [Category; 7] = [
        Category::Second,
        Category::Minute,
        Category::Hour,
        Category::Day,
        Category::Month,
        Category::Year,
        Category::Custom,
    ];

    /// Wire name of the category, as stored in Redis.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Second => "SECOND",
            Category::Minute => "MINUTE",
            Category::Hour => "HOUR",
            Category::Day => "DAY",
            Category::Month => "MONTH",
            Category::Year => "YEAR",
            Category::Custom => "CUSTOM",
        }
    }

    /// Length in seconds for categories with a fixed window.
    ///
    /// Months and years follow the calendar and custom windows carry their own
    /// length, so these return `None`.
    pub fn fixed_length_seconds(&self) -> Option<u64> {
        match self {
            Category::Second => Some(1),
            Category::Minute => Some(60),
            Category::Hour => Some(3_600),
            Category::Day => Some(86_400),
            Category::Month | Category::Year | Category::Custom => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| TollgateError::InvalidRule(format!("unknown category `{s}`")))
    }
}

/// Length of a custom window, in seconds.
///
/// Also used for the per-call override expiry passed to `increment`.
///
/// Must be at least 1 and at most [`MAX_WINDOW_SECONDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowSeconds(u64);

impl Deref for WindowSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSeconds {
    type Error = TollgateError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < 1 {
            Err(TollgateError::InvalidWindow(
                "Window must be at least 1 second".to_string(),
            ))
        } else if value > MAX_WINDOW_SECONDS {
            Err(TollgateError::InvalidWindow(format!(
                "Window must not be longer than {MAX_WINDOW_SECONDS} seconds"
            )))
        } else {
            Ok(Self(value))
        }
    }
}

/// One window of a [`LimiterRule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granularity {
    /// Window class.
    pub category: Category,
    /// Ceiling of allowed consumption in the current window.
    pub max_amount: u64,
    /// Consumption so far in the current window.
    ///
    /// Only populated by rule queries; `None` when defining a rule.
    pub now_amount: Option<u64>,
    /// Window length, present for [`Category::Custom`] only.
    pub window: Option<WindowSeconds>,
}

impl Granularity {
    /// A granularity for one of the calendar/fixed categories.
    pub fn new(category: Category, max_amount: u64) -> Self {
        Self {
            category,
            max_amount,
            now_amount: None,
            window: None,
        }
    }

    /// A [`Category::Custom`] granularity with an explicit window length.
    pub fn custom(window: WindowSeconds, max_amount: u64) -> Self {
        Self {
            category: Category::Custom,
            max_amount,
            now_amount: None,
            window: Some(window),
        }
    }
}

/// Identifier of a quota subject.
///
/// Built from one or more caller-supplied segments joined with [`KEY_SEPARATOR`].
///
/// Constraints:
/// - at least one segment, no segment empty
/// - no segment contains [`KEY_SEPARATOR`]
/// - at most [`MAX_KEY_LEN`] bytes once joined
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LimiterKey(Arc<str>);

impl LimiterKey {
    /// Join `segments` into a composite key.
    ///
    /// ```
    /// use tollgate::LimiterKey;
    ///
    /// let key = LimiterKey::from_segments(["api", "user1"]).unwrap();
    /// assert_eq!(&*key, "api/user1");
    /// ```
    pub fn from_segments<I, S>(segments: I) -> Result<Self, TollgateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        let mut count = 0usize;

        for segment in segments {
            let segment = segment.as_ref();

            if segment.is_empty() {
                return Err(TollgateError::InvalidKey(
                    "Key segments must not be empty".to_string(),
                ));
            }
            if segment.contains(KEY_SEPARATOR) {
                return Err(TollgateError::InvalidKey(format!(
                    "Key segment `{segment}` must not contain `{KEY_SEPARATOR}`"
                )));
            }

            if count > 0 {
                joined.push(KEY_SEPARATOR);
            }
            joined.push_str(segment);
            count += 1;
        }

        if count == 0 {
            return Err(TollgateError::InvalidKey(
                "Key must have at least one segment".to_string(),
            ));
        }
        if joined.len() > MAX_KEY_LEN {
            return Err(TollgateError::InvalidKey(format!(
                "Key must not be longer than {MAX_KEY_LEN} bytes"
            )));
        }

        Ok(Self(Arc::from(joined)))
    }

    /// The individual segments of this key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }

    /// The joined key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for LimiterKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for LimiterKey {
    type Error = TollgateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_segments(value.split(KEY_SEPARATOR))
    }
}

impl TryFrom<String> for LimiterKey {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

/// A quota definition (or, when returned by a query, a usage snapshot) for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterRule {
    /// Quota subject.
    pub key: LimiterKey,
    /// Windows enforced for `key`.
    ///
    /// Rules built with [`LimiterRule::new`] keep these in [`Category`] order.
    /// Query results are sorted ascending by `max_amount`.
    pub granularities: Vec<Granularity>,
    /// Store time in milliseconds at which a queried snapshot was taken.
    pub as_of_ms: Option<u64>,
}

impl LimiterRule {
    /// Build and validate a rule.
    ///
    /// Categories must be unique, [`Category::Custom`] must carry a window and the
    /// other categories must not. An empty granularity list is valid: setting it
    /// removes the rule for `key`.
    pub fn new(key: LimiterKey, granularities: Vec<Granularity>) -> Result<Self, TollgateError> {
        let mut granularities = granularities;
        granularities.sort_by_key(|g| g.category);

        for pair in granularities.windows(2) {
            if pair[0].category == pair[1].category {
                return Err(TollgateError::InvalidRule(format!(
                    "duplicate category {} for key `{key}`",
                    pair[0].category
                )));
            }
        }

        for granularity in &granularities {
            match (granularity.category, granularity.window) {
                (Category::Custom, None) => {
                    return Err(TollgateError::InvalidRule(
                        "CUSTOM granularity requires a window".to_string(),
                    ));
                }
                (category, Some(_)) if category != Category::Custom => {
                    return Err(TollgateError::InvalidRule(format!(
                        "{category} granularity must not carry a window"
                    )));
                }
                _ => {}
            }
        }

        Ok(Self {
            key,
            granularities,
            as_of_ms: None,
        })
    }

    /// Build a queried snapshot; granularities end up sorted by `max_amount`.
    pub(crate) fn snapshot(
        key: LimiterKey,
        mut granularities: Vec<Granularity>,
        as_of_ms: u64,
    ) -> Self {
        granularities.sort_by_key(|g| (g.max_amount, g.category));

        Self {
            key,
            granularities,
            as_of_ms: Some(as_of_ms),
        }
    }

    /// The granularity for `category`, if configured.
    pub fn granularity(&self, category: Category) -> Option<&Granularity> {
        self.granularities.iter().find(|g| g.category == category)
    }
}

/// Outcome of an increment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Every configured window had room; all counters were incremented.
    Accepted,
    /// No rule is configured for the key; nothing was recorded.
    AcceptedNoRule,
    /// A window was already at its ceiling; no counter was incremented.
    Rejected {
        /// First window (in rule order) found at capacity.
        category: Category,
        /// Counter value of that window at decision time.
        current_amount: u64,
        /// Overage count for that window's bucket after this rejection.
        overage_count: u64,
    },
}

impl QuotaDecision {
    /// `true` for [`QuotaDecision::Accepted`] and [`QuotaDecision::AcceptedNoRule`].
    pub fn is_accepted(&self) -> bool {
        !matches!(self, QuotaDecision::Rejected { .. })
    }
}

/// Number of rejected attempts for one key, category and window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OverageRecord {
    /// Window class that was at capacity.
    pub category: Category,
    /// Start of the window bucket, in seconds since the Unix epoch.
    pub bucket_start: i64,
    /// Rejections recorded in that bucket.
    pub count: u64,
}

impl OverageRecord {
    /// Parse a ledger field name, `<CATEGORY>_<bucket start>`.
    #[cfg_attr(not(feature = "redis-tokio"), allow(dead_code))]
    pub(crate) fn parse_field(field: &str) -> Option<(Category, i64)> {
        let (category, bucket_start) = field.rsplit_once('_')?;
        let category = category.parse().ok()?;
        let bucket_start = bucket_start.parse().ok()?;

        Some((category, bucket_start))
    }
}
