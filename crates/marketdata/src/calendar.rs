//! Market status derived from exchange trading hours.
//!
//! [`TradingCalendar`] answers [`MarketStatusProvider`] queries without any
//! upstream call: a market is trading when the current local time falls inside
//! one of its sessions on a weekday that is not a configured holiday.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use marketdata_core::{
    Clock, DataError, Market, MarketStatus, MarketStatusProvider, Result, SystemClock,
};
use tracing::trace;

/// A trading session as local `(start, end)` minutes of the day, end exclusive.
type Session = (u32, u32);

const fn hm(hour: u32, minute: u32) -> u32 {
    hour * 60 + minute
}

const CN_SESSIONS: &[Session] = &[(hm(9, 30), hm(11, 30)), (hm(13, 0), hm(15, 0))];
const HK_SESSIONS: &[Session] = &[(hm(9, 30), hm(12, 0)), (hm(13, 0), hm(16, 0))];
const US_SESSIONS: &[Session] = &[(hm(9, 30), hm(16, 0))];

const fn timezone(market: Market) -> Tz {
    match market {
        Market::Cn => chrono_tz::Asia::Shanghai,
        Market::Hk => chrono_tz::Asia::Hong_Kong,
        Market::Us => chrono_tz::America::New_York,
    }
}

const fn sessions(market: Market) -> &'static [Session] {
    match market {
        Market::Cn => CN_SESSIONS,
        Market::Hk => HK_SESSIONS,
        Market::Us => US_SESSIONS,
    }
}

/// Rule-based market-status provider.
///
/// Sessions:
///
/// | market | timezone | sessions |
/// |---|---|---|
/// | CN | Asia/Shanghai | 09:30-11:30, 13:00-15:00 |
/// | HK | Asia/Hong_Kong | 09:30-12:00, 13:00-16:00 |
/// | US | America/New_York | 09:30-16:00 |
///
/// Saturdays and Sundays are closed. Dates registered with
/// [`with_holiday`](Self::with_holiday) report [`MarketStatus::holiday`].
#[derive(Clone)]
pub struct TradingCalendar {
    clock: Arc<dyn Clock>,
    holidays: HashMap<Market, HashSet<NaiveDate>>,
}

impl fmt::Debug for TradingCalendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradingCalendar")
            .field("clock", &self.clock)
            .field(
                "holidays",
                &self
                    .holidays
                    .iter()
                    .map(|(market, dates)| (market.code(), dates.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar {
    /// Calendar reading the system clock, with no holidays.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Calendar reading `clock`, with no holidays.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            holidays: HashMap::new(),
        }
    }

    /// Marks `date` (in the market's local calendar) as a holiday.
    #[must_use]
    pub fn with_holiday(mut self, market: Market, date: NaiveDate) -> Self {
        self.holidays.entry(market).or_default().insert(date);
        self
    }

    /// Marks every date in `dates` as a holiday for `market`.
    #[must_use]
    pub fn with_holidays(mut self, market: Market, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.entry(market).or_default().extend(dates);
        self
    }

    /// Whether `date` is a configured holiday for `market`.
    #[must_use]
    pub fn is_holiday(&self, market: Market, date: NaiveDate) -> bool {
        self.holidays
            .get(&market)
            .is_some_and(|dates| dates.contains(&date))
    }

    /// Status of `market` at instant `at`.
    #[must_use]
    pub fn status_at(&self, market: Market, at: DateTime<Utc>) -> MarketStatus {
        let local = at.with_timezone(&timezone(market));
        let date = local.date_naive();

        if self.is_holiday(market, date) {
            return MarketStatus::holiday();
        }
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketStatus::closed();
        }

        let minute = local.hour() * 60 + local.minute();
        if sessions(market)
            .iter()
            .any(|&(start, end)| (start..end).contains(&minute))
        {
            MarketStatus::trading()
        } else {
            MarketStatus::closed()
        }
    }

    fn now(&self) -> Result<DateTime<Utc>> {
        let millis = self.clock.now_millis();
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| DataError::Other(format!("clock reading out of range: {millis}")))
    }
}

#[async_trait]
impl MarketStatusProvider for TradingCalendar {
    async fn get_status(&self, market: Market) -> Result<MarketStatus> {
        let status = self.status_at(market, self.now()?);
        trace!(market = %market, ?status, "TradingCalendar: resolved status");
        Ok(status)
    }
}
