//! Temporal attributes

use crate::enricher::{AttributeBag, Enricher};
use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, NaiveDate, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

/// Business-hours window applied in the configured timezone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHours {
    /// First hour of the working day (inclusive)
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,

    /// Last hour of the working day (exclusive)
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,

    /// Offset from UTC in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            utc_offset_minutes: 0,
        }
    }
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    18
}

/// Pluggable holiday source
pub trait HolidayCalendar: Send + Sync {
    /// Whether the given date is a holiday
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// Calendar with no holidays at all
pub struct NoHolidays;

impl HolidayCalendar for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// Calendar backed by an explicit date set
pub struct FixedHolidays(pub BTreeSet<NaiveDate>);

impl HolidayCalendar for FixedHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.0.contains(&date)
    }
}

/// Enricher producing business-hours and calendar attributes
pub struct TimeEnricher {
    hours: BusinessHours,
    calendar: Box<dyn HolidayCalendar>,
}

impl TimeEnricher {
    /// Create with the given window and no holidays
    pub fn new(hours: BusinessHours) -> Self {
        Self {
            hours,
            calendar: Box::new(NoHolidays),
        }
    }

    /// Replace the holiday calendar
    pub fn with_calendar(mut self, calendar: Box<dyn HolidayCalendar>) -> Self {
        self.calendar = calendar;
        self
    }
}

#[async_trait]
impl Enricher for TimeEnricher {
    fn name(&self) -> &str {
        "time"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> Result<AttributeBag> {
        let offset = FixedOffset::east_opt(self.hours.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        let local = ctx.timestamp.with_timezone(&offset);

        let weekday = local.weekday();
        let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let is_holiday = self.calendar.is_holiday(local.date_naive());
        let hour = local.hour();
        let in_window = hour >= self.hours.start_hour && hour < self.hours.end_hour;

        let mut bag = AttributeBag::new();
        bag.insert(
            "isBusinessHours".to_string(),
            json!(in_window && !is_weekend && !is_holiday),
        );
        bag.insert(
            "dayOfWeek".to_string(),
            json!(aegis_core::context::weekday_name(weekday)),
        );
        bag.insert("hour".to_string(), json!(hour));
        bag.insert("isWeekend".to_string(), json!(is_weekend));
        bag.insert("isHoliday".to_string(), json!(is_holiday));
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx_at(y: i32, m: u32, d: u32, hour: u32) -> DecisionContext {
        DecisionContext::new("a", "tools/call", "r")
            .with_timestamp(Utc.with_ymd_and_hms(y, m, d, hour, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_weekday_in_window() {
        let enricher = TimeEnricher::new(BusinessHours::default());
        // Monday 10:00 UTC
        let bag = enricher.enrich(&ctx_at(2025, 6, 2, 10)).await.unwrap();
        assert_eq!(bag["isBusinessHours"], json!(true));
        assert_eq!(bag["dayOfWeek"], json!("monday"));
        assert_eq!(bag["isWeekend"], json!(false));
    }

    #[tokio::test]
    async fn test_evening_outside_window() {
        let enricher = TimeEnricher::new(BusinessHours::default());
        let bag = enricher.enrich(&ctx_at(2025, 6, 2, 20)).await.unwrap();
        assert_eq!(bag["isBusinessHours"], json!(false));
    }

    #[tokio::test]
    async fn test_weekend_is_not_business_hours() {
        let enricher = TimeEnricher::new(BusinessHours::default());
        // Saturday 10:00
        let bag = enricher.enrich(&ctx_at(2025, 6, 7, 10)).await.unwrap();
        assert_eq!(bag["isWeekend"], json!(true));
        assert_eq!(bag["isBusinessHours"], json!(false));
    }

    #[tokio::test]
    async fn test_timezone_offset_shifts_window() {
        let enricher = TimeEnricher::new(BusinessHours {
            utc_offset_minutes: 9 * 60, // UTC+9
            ..Default::default()
        });
        // 01:00 UTC is 10:00 local
        let bag = enricher.enrich(&ctx_at(2025, 6, 2, 1)).await.unwrap();
        assert_eq!(bag["isBusinessHours"], json!(true));
        assert_eq!(bag["hour"], json!(10));
    }

    #[tokio::test]
    async fn test_holiday_calendar() {
        let mut dates = BTreeSet::new();
        dates.insert(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        let enricher = TimeEnricher::new(BusinessHours::default())
            .with_calendar(Box::new(FixedHolidays(dates)));

        let bag = enricher.enrich(&ctx_at(2025, 6, 2, 10)).await.unwrap();
        assert_eq!(bag["isHoliday"], json!(true));
        assert_eq!(bag["isBusinessHours"], json!(false));
    }
}
