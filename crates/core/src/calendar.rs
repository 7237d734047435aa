//! Exchange trading calendars.
//!
//! Session times are returned as naive America/New_York local time, which is
//! the clock the whole trader runs on.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::{Chicago, New_York};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::config::CalendarConfig;

/// Current New York wall-clock time.
#[must_use]
pub fn market_now() -> NaiveDateTime {
    Utc::now().with_timezone(&New_York).naive_local()
}

/// One trading session in New York local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub open: NaiveDateTime,
    pub close: NaiveDateTime,
}

/// Regular hours of one exchange calendar, in the exchange's own timezone.
#[derive(Debug, Clone, Copy)]
struct ExchangeHours {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

/// Maps exchange names as stored on underlyings to a calendar name.
#[must_use]
pub fn clean_exchange(exchange: &str) -> String {
    match exchange.to_uppercase().as_str() {
        "CBOE" => "CBOE_INDEX_OPTIONS".to_string(),
        other => other.to_string(),
    }
}

fn hours_for(calendar: &str) -> Option<ExchangeHours> {
    let equity = || ExchangeHours {
        tz: New_York,
        open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
        close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
    };

    match calendar {
        "NYSE" | "NASDAQ" | "ARCA" | "AMEX" | "BATS" | "ISLAND" | "SMART" => Some(equity()),
        "CBOE_INDEX_OPTIONS" => Some(ExchangeHours {
            tz: Chicago,
            open: NaiveTime::from_hms_opt(8, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 15, 0).unwrap_or_default(),
        }),
        _ => None,
    }
}

fn to_new_york(tz: Tz, local: NaiveDateTime) -> Option<NaiveDateTime> {
    tz.from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&New_York).naive_local())
}

pub struct MarketCalendar {
    holidays: HashSet<NaiveDate>,
    early_closes: HashMap<NaiveDate, NaiveTime>,
}

impl MarketCalendar {
    #[must_use]
    pub fn new(config: &CalendarConfig) -> Self {
        Self {
            holidays: config.holidays.iter().copied().collect(),
            early_closes: config
                .early_closes
                .iter()
                .map(|e| (e.date, e.close))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Today's (or `date`'s) session for `exchange`, `None` when closed or unknown.
    #[must_use]
    pub fn schedule(&self, exchange: &str, date: NaiveDate) -> Option<Session> {
        let calendar = clean_exchange(exchange);
        let Some(hours) = hours_for(&calendar) else {
            warn!(exchange, "No calendar for exchange");
            return None;
        };

        if !self.is_trading_day(date) {
            return None;
        }

        let close_time = self.early_closes.get(&date).copied().unwrap_or(hours.close);
        let open = to_new_york(hours.tz, date.and_time(hours.open))?;
        let close = to_new_york(hours.tz, date.and_time(close_time))?;

        if open >= close {
            warn!(exchange, %date, "Invalid schedule encountered");
            return None;
        }

        Some(Session { open, close })
    }

    /// The open of the first trading day and the close of the last trading
    /// day in `start..=end`. Used to turn an option expiry date into the exact
    /// time it stops trading.
    #[must_use]
    pub fn schedule_range(&self, exchange: &str, start: NaiveDate, end: NaiveDate) -> Option<Session> {
        if end < start {
            return None;
        }

        let sessions: Vec<Session> = start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter_map(|d| self.schedule(exchange, d))
            .collect();

        match (sessions.first(), sessions.last()) {
            (Some(first), Some(last)) => Some(Session {
                open: first.open,
                close: last.close,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EarlyClose;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(d: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        d.and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn nyse_regular_session() {
        let calendar = MarketCalendar::new(&CalendarConfig::default());
        let day = date(2021, 11, 24); // Wednesday
        let session = calendar.schedule("NYSE", day).unwrap();
        assert_eq!(session.open, at(day, 9, 30));
        assert_eq!(session.close, at(day, 16, 0));
    }

    #[test]
    fn cboe_is_converted_from_central_time() {
        let calendar = MarketCalendar::new(&CalendarConfig::default());
        let day = date(2021, 11, 24);
        let session = calendar.schedule("cboe", day).unwrap();
        assert_eq!(session.open, at(day, 9, 30));
        assert_eq!(session.close, at(day, 16, 15));
    }

    #[test]
    fn weekends_and_holidays_are_closed() {
        let config = CalendarConfig {
            holidays: vec![date(2021, 11, 25)],
            early_closes: vec![],
        };
        let calendar = MarketCalendar::new(&config);
        assert!(calendar.schedule("NASDAQ", date(2021, 11, 27)).is_none());
        assert!(calendar.schedule("NASDAQ", date(2021, 11, 25)).is_none());
    }

    #[test]
    fn early_close_overrides_close_time() {
        let config = CalendarConfig {
            holidays: vec![],
            early_closes: vec![EarlyClose {
                date: date(2021, 11, 26),
                close: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            }],
        };
        let calendar = MarketCalendar::new(&config);
        let session = calendar.schedule("NYSE", date(2021, 11, 26)).unwrap();
        assert_eq!(session.close, at(date(2021, 11, 26), 13, 0));
    }

    #[test]
    fn unknown_exchange_has_no_schedule() {
        let calendar = MarketCalendar::new(&CalendarConfig::default());
        assert!(calendar.schedule("LSE", date(2021, 11, 24)).is_none());
    }

    #[test]
    fn range_spans_first_open_to_last_close() {
        let calendar = MarketCalendar::new(&CalendarConfig::default());
        // Friday through the following Monday
        let session = calendar
            .schedule_range("NYSE", date(2021, 11, 19), date(2021, 11, 22))
            .unwrap();
        assert_eq!(session.open, at(date(2021, 11, 19), 9, 30));
        assert_eq!(session.close, at(date(2021, 11, 22), 16, 0));
    }

    #[test]
    fn range_over_weekend_only_is_empty() {
        let calendar = MarketCalendar::new(&CalendarConfig::default());
        assert!(calendar
            .schedule_range("NYSE", date(2021, 11, 20), date(2021, 11, 21))
            .is_none());
    }
}
