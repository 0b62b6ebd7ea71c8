/// Exchange-hours calendar
///
/// The engine only asks two questions: is the venue open right now, and
/// how many minutes remain until the close. Holiday handling belongs to
/// whoever implements the trait.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

pub trait MarketCalendar: Send + Sync {
    fn is_open(&self, now: DateTime<Utc>) -> bool;

    /// Minutes until today's close; negative once the close has passed.
    fn minutes_to_close(&self, now: DateTime<Utc>) -> i64;
}

/// Fixed NYSE session: 9:30-16:00 America/New_York, weekdays.
pub struct NyseCalendar;

const OPEN_MINUTE: i64 = 9 * 60 + 30;
const CLOSE_MINUTE: i64 = 16 * 60;

impl NyseCalendar {
    fn minute_of_day(now: DateTime<Utc>) -> (Weekday, i64) {
        let local = now.with_timezone(&New_York);
        let minute = local.hour() as i64 * 60 + local.minute() as i64;
        (local.weekday(), minute)
    }
}

impl MarketCalendar for NyseCalendar {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        let (day, minute) = Self::minute_of_day(now);
        if day == Weekday::Sat || day == Weekday::Sun {
            return false;
        }
        minute >= OPEN_MINUTE && minute < CLOSE_MINUTE
    }

    fn minutes_to_close(&self, now: DateTime<Utc>) -> i64 {
        let (_, minute) = Self::minute_of_day(now);
        CLOSE_MINUTE - minute
    }
}

/// Crypto pairs trade around the clock and carry a dash (e.g. BTC-USD).
pub fn is_crypto(symbol: &str) -> bool {
    symbol.contains('-')
}
