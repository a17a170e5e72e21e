use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const GENERIC_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%d.%m.%Y"];

/// What to do when no pattern recognises a date cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DateFallback {
    /// Use the run's current instant and flag the row.
    #[default]
    Now,
    /// Reject the row.
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct DateContext {
    pub local_offset: FixedOffset,
    pub now: DateTime<FixedOffset>,
    pub fallback: DateFallback,
}

impl DateContext {
    pub fn new(local_offset: FixedOffset, now: DateTime<FixedOffset>) -> Self {
        Self {
            local_offset,
            now,
            fallback: DateFallback::Now,
        }
    }

    /// Host clock and host offset.
    pub fn system() -> Self {
        let now = Local::now();
        let offset = *now.offset();
        Self::new(offset, now.with_timezone(&offset))
    }

    pub fn with_fallback(mut self, fallback: DateFallback) -> Self {
        self.fallback = fallback;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DateSource {
    Timestamp,
    DayFirst,
    Generic,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedDate {
    pub instant: DateTime<FixedOffset>,
    /// Calendar day in the run's local offset.
    pub day: NaiveDate,
    pub source: DateSource,
    /// True when the value is the run-time fallback rather than the cell's date.
    pub lossy: bool,
}

/// Resolves a raw date cell. `None` only under [`DateFallback::Reject`].
pub fn resolve_date(raw: &str, ctx: &DateContext) -> Option<ResolvedDate> {
    let s = raw.trim();

    if looks_like_timestamp(s) {
        if let Some(instant) = parse_timestamp(s, ctx.local_offset) {
            return Some(ResolvedDate {
                instant,
                day: instant.with_timezone(&ctx.local_offset).date_naive(),
                source: DateSource::Timestamp,
                lossy: false,
            });
        }
    } else if let Some(day) = parse_day_first(s) {
        if let Some(r) = at_local_noon(day, ctx, DateSource::DayFirst) {
            return Some(r);
        }
    }

    if let Some(day) = parse_generic(s) {
        if let Some(r) = at_local_noon(day, ctx, DateSource::Generic) {
            return Some(r);
        }
    }

    match ctx.fallback {
        DateFallback::Reject => None,
        DateFallback::Now => {
            tracing::warn!(raw = s, "unrecognised date; using run time");
            Some(ResolvedDate {
                instant: ctx.now,
                day: ctx.now.with_timezone(&ctx.local_offset).date_naive(),
                source: DateSource::Fallback,
                lossy: true,
            })
        }
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    if s.contains('T') {
        return true;
    }
    let b = s.as_bytes();
    b.windows(3)
        .any(|w| w[0] == b':' && w[1].is_ascii_digit() && w[2].is_ascii_digit())
}

fn parse_timestamp(s: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
}

/// `D[D]-M[M]-YYYY` or `D[D]/M[M]/YYYY`, one separator throughout.
fn parse_day_first(s: &str) -> Option<NaiveDate> {
    let sep = s.chars().find(|c| *c == '-' || *c == '/')?;
    let parts = s.split(sep).collect::<Vec<_>>();
    let [d, m, y] = parts.as_slice() else {
        return None;
    };
    let digits = |p: &str, min: usize, max: usize| {
        (min..=max).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits(*d, 1, 2) || !digits(*m, 1, 2) || !digits(*y, 4, 4) {
        return None;
    }
    let (day, month, year) = (d.parse::<u32>().ok()?, m.parse::<u32>().ok()?, y.parse::<i32>().ok()?);
    if !(1..=31).contains(&day) || !(1..=12).contains(&month) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_generic(s: &str) -> Option<NaiveDate> {
    GENERIC_DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
}

/// Noon keeps the calendar day stable when the instant is shown in a nearby zone.
fn at_local_noon(day: NaiveDate, ctx: &DateContext, source: DateSource) -> Option<ResolvedDate> {
    let instant = ctx
        .local_offset
        .from_local_datetime(&day.and_hms_opt(12, 0, 0)?)
        .single()?;
    Some(ResolvedDate {
        instant,
        day,
        source,
        lossy: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn ctx(offset_hours: i32) -> DateContext {
        let off = FixedOffset::east_opt(offset_hours * 3600).expect("offset");
        let now = off
            .with_ymd_and_hms(2025, 9, 1, 8, 30, 0)
            .single()
            .expect("now");
        DateContext::new(off, now)
    }

    #[test]
    fn day_first_keeps_calendar_day_across_offsets() {
        for local in -12..=14 {
            let c = ctx(local);
            let r = resolve_date("05-03-2025", &c).expect("resolved");
            assert_eq!(r.source, DateSource::DayFirst);
            assert!(!r.lossy);
            for shift in -11..=11 {
                let render = local + shift;
                if !(-12..=14).contains(&render) {
                    continue;
                }
                let tz = FixedOffset::east_opt(render * 3600).expect("offset");
                let d = r.instant.with_timezone(&tz).date_naive();
                assert_eq!((d.year(), d.month(), d.day()), (2025, 3, 5), "local {local} render {render}");
            }
        }
    }

    #[test]
    fn slash_and_single_digit_forms() {
        let r = resolve_date("5/3/2025", &ctx(-3)).expect("resolved");
        assert_eq!(r.day, NaiveDate::from_ymd_opt(2025, 3, 5).expect("date"));
    }

    #[test]
    fn timestamps_skip_day_first() {
        let r = resolve_date("2025-03-05T10:15:00Z", &ctx(-3)).expect("resolved");
        assert_eq!(r.source, DateSource::Timestamp);
        assert_eq!(r.instant.to_rfc3339(), "2025-03-05T10:15:00+00:00");
    }

    #[test]
    fn invalid_calendar_date_falls_back_lossy() {
        let c = ctx(-3);
        let r = resolve_date("31-02-2025", &c).expect("fallback");
        assert!(r.lossy);
        assert_eq!(r.instant, c.now);
        assert!(resolve_date("ayer", &c.with_fallback(DateFallback::Reject)).is_none());
    }

    #[test]
    fn iso_calendar_date_is_generic() {
        let r = resolve_date("2025-03-05", &ctx(2)).expect("resolved");
        assert_eq!(r.source, DateSource::Generic);
        assert_eq!(r.day.day(), 5);
    }
}
