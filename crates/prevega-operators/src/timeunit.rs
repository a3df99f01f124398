//! `timeunit` operator: floors timestamps to calendar units in a timezone.
//!
//! Units not listed take Vega's defaults (year 2012, January, the 1st,
//! midnight), so `["month"]` maps every timestamp onto a month of 2012.
//! Weeks start on Sunday.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;

use prevega_core::dag::TimeUnitPart;
use prevega_core::schema::{DataType, Field, Schema};
use prevega_core::types::{Column, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

const DEFAULT_YEAR: i32 = 2012;

pub struct TimeUnit {
    pub field: String,
    pub units: Vec<TimeUnitPart>,
    pub timezone: String,
    pub alias: (String, String),
}

impl TimeUnit {
    fn tz(&self) -> Result<Tz, OpError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| OpError::Plan(format!("unknown timezone '{}'", self.timezone)))
    }

    fn has(&self, unit: TimeUnitPart) -> bool {
        self.units.contains(&unit)
    }

    /// Floor a local wall-clock time to the unit start.
    fn floor_local(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        use TimeUnitPart::*;
        let year = if self.has(Year) { local.year() } else { DEFAULT_YEAR };
        let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;

        let date = if self.has(Week) {
            let actual_jan1 = NaiveDate::from_ymd_opt(local.year(), 1, 1)?;
            let week = (local.ordinal0() as i64
                + actual_jan1.weekday().num_days_from_sunday() as i64)
                / 7;
            jan1 + Duration::days(7 * week - jan1.weekday().num_days_from_sunday() as i64)
        } else if self.has(DayOfYear) {
            jan1 + Duration::days(local.ordinal0() as i64)
        } else {
            let month0 = if self.has(Month) {
                local.month0()
            } else if self.has(Quarter) {
                local.month0() / 3 * 3
            } else {
                0
            };
            let day = if self.has(Date) {
                local.day()
            } else if self.has(Day) {
                7 + local.weekday().num_days_from_sunday()
            } else {
                1
            };
            NaiveDate::from_ymd_opt(year, month0 + 1, 1)? + Duration::days(day as i64 - 1)
        };

        let pick = |unit, v: u32| if self.has(unit) { v } else { 0 };
        date.and_hms_milli_opt(
            pick(Hours, local.hour()),
            pick(Minutes, local.minute()),
            pick(Seconds, local.second()),
            pick(Milliseconds, local.nanosecond() / 1_000_000 % 1000),
        )
    }

    /// Start of the next unit after `start`.
    fn step_local(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        use TimeUnitPart::*;
        match self.units.iter().max()? {
            Year => start.checked_add_months(Months::new(12)),
            Quarter => start.checked_add_months(Months::new(3)),
            Month => start.checked_add_months(Months::new(1)),
            Week => Some(start + Duration::days(7)),
            Date | Day | DayOfYear => Some(start + Duration::days(1)),
            Hours => Some(start + Duration::hours(1)),
            Minutes => Some(start + Duration::minutes(1)),
            Seconds => Some(start + Duration::seconds(1)),
            Milliseconds => Some(start + Duration::milliseconds(1)),
        }
    }

    /// `(unit0, unit1)` in epoch milliseconds.
    pub fn apply(&self, tz: &Tz, ms: i64) -> Option<(i64, i64)> {
        let local = DateTime::from_timestamp_millis(ms)?
            .with_timezone(tz)
            .naive_local();
        let start = self.floor_local(local)?;
        let end = self.step_local(start)?;
        Some((to_epoch_ms(tz, start)?, to_epoch_ms(tz, end)?))
    }
}

/// Local wall-clock time to epoch ms; times inside a DST gap move forward.
fn to_epoch_ms(tz: &Tz, local: NaiveDateTime) -> Option<i64> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.timestamp_millis())
}

impl Operator for TimeUnit {
    fn name(&self) -> &'static str {
        "timeunit"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        input.require(&self.field)?;
        self.tz()?;
        if self.units.is_empty() {
            return Err(OpError::Plan("timeunit without units".into()));
        }
        Ok(input
            .with_field(Field::new(self.alias.0.clone(), DataType::Timestamp, true))
            .with_field(Field::new(self.alias.1.clone(), DataType::Timestamp, true)))
    }

    fn eval(&self, mut input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        self.plan(&input.schema())?;
        let tz = self.tz()?;
        let col = input.require(&self.field)?;
        let (unit0, unit1): (Vec<_>, Vec<_>) = col
            .values
            .iter()
            .map(|v| match v.as_epoch_ms().and_then(|ms| self.apply(&tz, ms)) {
                Some((a, b)) => (Scalar::Timestamp(a), Scalar::Timestamp(b)),
                None => (Scalar::Null, Scalar::Null),
            })
            .unzip();
        input.set_column(Column::new(self.alias.0.clone(), DataType::Timestamp, unit0));
        input.set_column(Column::new(self.alias.1.clone(), DataType::Timestamp, unit1));
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prevega_core::types::parse_datetime_ms;

    fn op(units: Vec<TimeUnitPart>, tz: &str) -> TimeUnit {
        TimeUnit {
            field: "t".into(),
            units,
            timezone: tz.into(),
            alias: ("unit0".into(), "unit1".into()),
        }
    }

    fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn year_month_floor_in_utc() {
        let t = op(vec![TimeUnitPart::Year, TimeUnitPart::Month], "UTC");
        let tz = t.tz().unwrap();
        let input = parse_datetime_ms("2021-03-17T13:45:00Z").unwrap();
        assert_eq!(
            t.apply(&tz, input),
            Some((ms(2021, 3, 1, 0), ms(2021, 4, 1, 0)))
        );
    }

    #[test]
    fn missing_units_default_to_2012() {
        let t = op(vec![TimeUnitPart::Month], "UTC");
        let tz = t.tz().unwrap();
        let input = ms(2019, 7, 20, 5);
        assert_eq!(t.apply(&tz, input).unwrap().0, ms(2012, 7, 1, 0));
    }

    #[test]
    fn week_floors_to_sunday() {
        let t = op(vec![TimeUnitPart::Year, TimeUnitPart::Week], "UTC");
        let tz = t.tz().unwrap();
        // 2021-03-17 is a Wednesday; the week began Sunday 2021-03-14.
        let (start, end) = t.apply(&tz, ms(2021, 3, 17, 10)).unwrap();
        assert_eq!(start, ms(2021, 3, 14, 0));
        assert_eq!(end, ms(2021, 3, 21, 0));
    }

    #[test]
    fn floors_in_the_requested_timezone() {
        let parts = vec![TimeUnitPart::Year, TimeUnitPart::Month, TimeUnitPart::Date];
        let t = op(parts, "America/New_York");
        let tz = t.tz().unwrap();
        // 03:00 UTC on the 2nd is still the 1st in New York (UTC-5).
        let (start, _) = t.apply(&tz, ms(2021, 2, 2, 3)).unwrap();
        assert_eq!(start, ms(2021, 2, 1, 5));
    }
}
