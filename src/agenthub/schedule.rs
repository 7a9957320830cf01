//! Schedule templates and next-run computation.
//!
//! A [`ScheduledTask`] is a template living inside a workspace; the
//! scheduler poller materializes it into a concrete task whenever
//! `next_run` falls due, then advances `next_run` per the
//! [`ScheduleConfig`].
//!
//! Advance semantics: `interval` schedules step along the grid anchored
//! at the previous `next_run` (a stale template advances past `now`
//! without backfilling the missed epochs); `daily`/`weekly`/`cron`
//! compute the next wall-clock match strictly after `now`. A one-shot
//! template disables itself after materializing once.
//!
//! Timezones are `"UTC"` (default) or fixed offsets like `"+02:00"`.
//! The 5-field cron dialect (minute, hour, day-of-month, month,
//! day-of-week) supports `*`, lists, ranges, and steps; day-of-month
//! and day-of-week combine with the usual either-matches rule when both
//! are restricted.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Consecutive materialization failures before a template is disabled.
pub const DEFAULT_FAILURE_DISABLE_THRESHOLD: u64 = 5;

/// Errors raised while parsing or evaluating schedules.
#[derive(Debug, Clone)]
pub enum ScheduleError {
    InvalidExpression(String),
    InvalidTimezone(String),
    InvalidTimeOfDay(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidExpression(msg) => {
                write!(f, "invalid schedule expression: {}", msg)
            }
            ScheduleError::InvalidTimezone(tz) => write!(f, "invalid timezone: {:?}", tz),
            ScheduleError::InvalidTimeOfDay(t) => write!(f, "invalid time of day: {:?}", t),
        }
    }
}

impl Error for ScheduleError {}

/// The schedule variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at a fixed instant, then disable.
    Once { execute_at: DateTime<Utc> },
    /// Fire every `interval_secs` seconds.
    Interval { interval_secs: u64 },
    /// Fire daily at a wall-clock time in an optional fixed-offset zone.
    Daily {
        time_of_day: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fire weekly on a day at a wall-clock time.
    Weekly {
        day_of_week: String,
        time_of_day: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// 5-field cron expression, evaluated in UTC.
    Cron { expression: String },
}

/// A schedule: the firing rule plus the common caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(flatten)]
    pub kind: ScheduleKind,
    /// Maximum number of materializations; 0 = unbounded.
    #[serde(default)]
    pub max_runs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl From<ScheduleKind> for ScheduleConfig {
    fn from(kind: ScheduleKind) -> Self {
        Self {
            kind,
            max_runs: 0,
            end_date: None,
        }
    }
}

fn parse_timezone(tz: Option<&str>) -> Result<FixedOffset, ScheduleError> {
    let tz = match tz {
        None | Some("") | Some("UTC") | Some("utc") | Some("Z") => {
            return Ok(FixedOffset::east_opt(0).expect("zero offset"))
        }
        Some(tz) => tz,
    };
    FixedOffset::from_str(tz).map_err(|_| ScheduleError::InvalidTimezone(tz.to_string()))
}

fn parse_time_of_day(t: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .map_err(|_| ScheduleError::InvalidTimeOfDay(t.to_string()))
}

fn parse_day_of_week(d: &str) -> Result<Weekday, ScheduleError> {
    d.parse::<Weekday>()
        .map_err(|_| ScheduleError::InvalidExpression(format!("bad day of week: {:?}", d)))
}

/// Next instant with the given wall-clock time in `tz`, strictly after
/// `after`, optionally constrained to a weekday.
fn next_wall_clock(
    after: DateTime<Utc>,
    time: NaiveTime,
    tz: FixedOffset,
    weekday: Option<Weekday>,
) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz);
    let mut date = local_after.date_naive();
    for _ in 0..8 {
        if weekday.map_or(true, |w| date.weekday() == w) {
            if let Some(candidate) = tz
                .from_local_datetime(&date.and_time(time))
                .single()
                .map(|dt| dt.with_timezone(&Utc))
            {
                if candidate > after {
                    return Some(candidate);
                }
            }
        }
        date = date.checked_add_days(Days::new(1))?;
    }
    None
}

impl ScheduleConfig {
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, ScheduleKind::Once { .. })
    }

    /// Parse-check the schedule without computing anything.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match &self.kind {
            ScheduleKind::Once { .. } => Ok(()),
            ScheduleKind::Interval { interval_secs } => {
                if *interval_secs == 0 {
                    Err(ScheduleError::InvalidExpression(
                        "interval must be positive".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            ScheduleKind::Daily {
                time_of_day,
                timezone,
            } => {
                parse_time_of_day(time_of_day)?;
                parse_timezone(timezone.as_deref())?;
                Ok(())
            }
            ScheduleKind::Weekly {
                day_of_week,
                time_of_day,
                timezone,
            } => {
                parse_day_of_week(day_of_week)?;
                parse_time_of_day(time_of_day)?;
                parse_timezone(timezone.as_deref())?;
                Ok(())
            }
            ScheduleKind::Cron { expression } => CronExpr::parse(expression).map(|_| ()),
        }
    }

    /// `next_run` for a freshly created template.
    pub fn initial_next_run(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Once { execute_at } => Ok(Some(*execute_at)),
            _ => self.advance(None, now),
        }
    }

    /// Compute the `next_run` following a materialization (or failed
    /// materialization) at `now`, given the previous `next_run`.
    ///
    /// Interval schedules step along the grid anchored at `prev_next`
    /// until past `now`, so a stale template skips its backlog instead
    /// of backfilling. Wall-clock schedules return the next match
    /// strictly after `now`.
    pub fn advance(
        &self,
        prev_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Once { .. } => Ok(None),
            ScheduleKind::Interval { interval_secs } => {
                if *interval_secs == 0 {
                    return Err(ScheduleError::InvalidExpression(
                        "interval must be positive".to_string(),
                    ));
                }
                let step = Duration::seconds(*interval_secs as i64);
                let mut candidate = prev_next.unwrap_or(now) + step;
                while candidate <= now {
                    candidate += step;
                }
                Ok(Some(candidate))
            }
            ScheduleKind::Daily {
                time_of_day,
                timezone,
            } => {
                let time = parse_time_of_day(time_of_day)?;
                let tz = parse_timezone(timezone.as_deref())?;
                Ok(next_wall_clock(now, time, tz, None))
            }
            ScheduleKind::Weekly {
                day_of_week,
                time_of_day,
                timezone,
            } => {
                let weekday = parse_day_of_week(day_of_week)?;
                let time = parse_time_of_day(time_of_day)?;
                let tz = parse_timezone(timezone.as_deref())?;
                Ok(next_wall_clock(now, time, tz, Some(weekday)))
            }
            ScheduleKind::Cron { expression } => {
                let expr = CronExpr::parse(expression)?;
                Ok(expr.next_match(now))
            }
        }
    }
}

/// What to do at startup with a template whose `next_run` is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedPolicy {
    /// Recurring default: the next tick materializes once and advances
    /// past `now` (the backlog is skipped); a missed one-shot is
    /// disabled without materializing.
    Skip,
    /// One-shot default: materialize once immediately.
    CatchUp,
}

/// A scheduled-task template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub from: String,
    pub to: String,
    /// Becomes the materialized task's description.
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub schedule: ScheduleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub consecutive_failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default = "default_missed_policy")]
    pub missed_policy: MissedPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_missed_policy() -> MissedPolicy {
    MissedPolicy::Skip
}

impl ScheduledTask {
    pub fn new(
        workspace_id: Uuid,
        name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        prompt: impl Into<String>,
        schedule: ScheduleConfig,
    ) -> Result<Self, ScheduleError> {
        schedule.validate()?;
        let now = Utc::now();
        let next_run = schedule.initial_next_run(now)?;
        let missed_policy = if schedule.is_one_shot() {
            MissedPolicy::CatchUp
        } else {
            MissedPolicy::Skip
        };
        Ok(Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            description: String::new(),
            from: from.into(),
            to: to.into(),
            prompt: prompt.into(),
            priority: 0,
            context: Map::new(),
            timeout_secs: None,
            schedule,
            next_run,
            last_run: None,
            enabled: true,
            execution_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_result: None,
            last_error: None,
            missed_policy,
            created_at: now,
            updated_at: now,
        })
    }

    /// Due when enabled and `next_run` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }

    /// Record a successful materialization at `now` and advance.
    pub fn mark_materialized(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let prev_next = self.next_run;
        self.last_run = Some(now);
        self.execution_count += 1;
        self.consecutive_failures = 0;
        self.updated_at = now;

        if self.schedule.is_one_shot() {
            self.next_run = None;
            self.enabled = false;
            return Ok(());
        }

        self.next_run = self.schedule.advance(prev_next, now)?;
        self.apply_limits();
        Ok(())
    }

    /// Record a failed materialization: advance without counting an
    /// execution, and disable after `threshold` consecutive failures.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        threshold: u64,
    ) -> Result<(), ScheduleError> {
        let prev_next = self.next_run;
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
        self.next_run = self.schedule.advance(prev_next, now)?;
        if self.consecutive_failures >= threshold {
            log::warn!(
                "scheduled task {} disabled after {} consecutive failures",
                self.name,
                self.consecutive_failures
            );
            self.enabled = false;
            self.next_run = None;
        } else {
            self.apply_limits();
        }
        Ok(())
    }

    fn apply_limits(&mut self) {
        if self.schedule.max_runs > 0 && self.execution_count >= self.schedule.max_runs {
            self.enabled = false;
            self.next_run = None;
            return;
        }
        if let (Some(next), Some(end)) = (self.next_run, self.schedule.end_date) {
            if next > end {
                self.enabled = false;
                self.next_run = None;
            }
        }
    }

    /// Startup reconciliation for a stale `next_run` (before `now`).
    ///
    /// `skip` on a one-shot disables it without materializing; every
    /// other combination leaves the template due so the first tick
    /// materializes exactly once and the advance skips the backlog.
    pub fn apply_missed_policy(&mut self, now: DateTime<Utc>) {
        if !self.enabled || !self.next_run.is_some_and(|next| next < now) {
            return;
        }
        if self.missed_policy == MissedPolicy::Skip && self.schedule.is_one_shot() {
            self.enabled = false;
            self.next_run = None;
            self.updated_at = now;
        }
    }
}

// ---- cron ----

/// Parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: [bool; 60],
    hour: [bool; 24],
    day_of_month: [bool; 32],
    month: [bool; 13],
    day_of_week: [bool; 7],
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::InvalidExpression(format!(
                "expected 5 fields, got {} in {:?}",
                fields.len(),
                expression
            )));
        }
        let minute = parse_field(fields[0], 0, 59)?;
        let hour = parse_field(fields[1], 0, 23)?;
        let dom = parse_field(fields[2], 1, 31)?;
        let month = parse_field(fields[3], 1, 12)?;
        // Accept 0-7 with both 0 and 7 meaning Sunday.
        let dow_raw = parse_field(fields[4], 0, 7)?;

        let mut expr = CronExpr {
            minute: [false; 60],
            hour: [false; 24],
            day_of_month: [false; 32],
            month: [false; 13],
            day_of_week: [false; 7],
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        };
        for v in minute {
            expr.minute[v as usize] = true;
        }
        for v in hour {
            expr.hour[v as usize] = true;
        }
        for v in dom {
            expr.day_of_month[v as usize] = true;
        }
        for v in month {
            expr.month[v as usize] = true;
        }
        for v in dow_raw {
            expr.day_of_week[(v % 7) as usize] = true;
        }
        Ok(expr)
    }

    fn matches_date(&self, date: chrono::NaiveDate) -> bool {
        if !self.month[date.month() as usize] {
            return false;
        }
        let dom_ok = self.day_of_month[date.day() as usize];
        let dow_ok = self.day_of_week[date.weekday().num_days_from_sunday() as usize];
        // Standard cron rule: when both fields are restricted, either
        // matching selects the day.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }

    /// Next match strictly after `after`, minute resolution, searched up
    /// to four years out.
    pub fn next_match(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        let start_date = start.date_naive();
        for day_offset in 0..(4 * 366) {
            let date = start_date.checked_add_days(Days::new(day_offset))?;
            if !self.matches_date(date) {
                continue;
            }
            for hour in 0..24u32 {
                if !self.hour[hour as usize] {
                    continue;
                }
                for minute in 0..60u32 {
                    if !self.minute[minute as usize] {
                        continue;
                    }
                    let naive = date.and_hms_opt(hour, minute, 0)?;
                    let candidate = Utc.from_utc_datetime(&naive);
                    if candidate >= start {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, ScheduleError> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ScheduleError::InvalidExpression(format!("bad step in {:?}", part))
                })?;
                if step == 0 {
                    return Err(ScheduleError::InvalidExpression(format!(
                        "zero step in {:?}",
                        part
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| {
                ScheduleError::InvalidExpression(format!("bad range in {:?}", part))
            })?;
            let hi: u32 = hi.parse().map_err(|_| {
                ScheduleError::InvalidExpression(format!("bad range in {:?}", part))
            })?;
            (lo, hi)
        } else {
            let v: u32 = range.parse().map_err(|_| {
                ScheduleError::InvalidExpression(format!("bad value in {:?}", part))
            })?;
            (v, v)
        };
        if lo < min || hi > max || lo > hi {
            return Err(ScheduleError::InvalidExpression(format!(
                "value out of range in {:?} (allowed {}-{})",
                part, min, max
            )));
        }
        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn interval(secs: u64) -> ScheduleConfig {
        ScheduleKind::Interval {
            interval_secs: secs,
        }
        .into()
    }

    fn daily(t: &str, tz: &str) -> ScheduleConfig {
        ScheduleKind::Daily {
            time_of_day: t.to_string(),
            timezone: Some(tz.to_string()),
        }
        .into()
    }

    fn template(schedule: ScheduleConfig) -> ScheduledTask {
        ScheduledTask::new(
            Uuid::new_v4(),
            "report",
            "orchestrator",
            "researcher",
            "write the morning report",
            schedule,
        )
        .unwrap()
    }

    #[test]
    fn interval_advance_is_monotone() {
        let schedule = interval(3600);
        let t = utc("2025-11-01T00:00:00Z");
        let n1 = schedule.advance(Some(t), t).unwrap().unwrap();
        let n2 = schedule.advance(Some(n1), n1).unwrap().unwrap();
        assert_eq!(n1, t + Duration::hours(1));
        assert_eq!(n2, t + Duration::hours(2));
    }

    #[test]
    fn interval_advance_skips_backlog_onto_the_grid() {
        // next_run was 01:00; the process wakes at 05:30. The advance
        // lands on 06:00, not 06:30, and not five backfilled epochs.
        let schedule = interval(3600);
        let next = schedule
            .advance(
                Some(utc("2025-11-01T01:00:00Z")),
                utc("2025-11-01T05:30:00Z"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2025-11-01T06:00:00Z"));
    }

    #[test]
    fn daily_advance_matches_spec_example() {
        let schedule = daily("09:00", "UTC");
        let next = schedule
            .advance(None, utc("2025-11-01T09:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2025-11-02T09:00:00Z"));
    }

    #[test]
    fn daily_before_the_hour_fires_same_day() {
        let schedule = daily("09:00", "UTC");
        let next = schedule
            .advance(None, utc("2025-11-01T08:59:30Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2025-11-01T09:00:00Z"));
    }

    #[test]
    fn daily_respects_fixed_offset() {
        let schedule = daily("09:00", "+02:00");
        let next = schedule
            .advance(None, utc("2025-11-01T06:59:00Z"))
            .unwrap()
            .unwrap();
        // 09:00 at +02:00 is 07:00 UTC.
        assert_eq!(next, utc("2025-11-01T07:00:00Z"));
    }

    #[test]
    fn weekly_finds_the_right_day() {
        let schedule: ScheduleConfig = ScheduleKind::Weekly {
            day_of_week: "monday".to_string(),
            time_of_day: "10:00".to_string(),
            timezone: None,
        }
        .into();
        // 2025-11-01 is a Saturday.
        let next = schedule
            .advance(None, utc("2025-11-01T12:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2025-11-03T10:00:00Z"));
    }

    #[test]
    fn once_template_disables_after_one_materialization() {
        let at = Utc::now() + Duration::minutes(5);
        let mut template = template(ScheduleKind::Once { execute_at: at }.into());
        assert_eq!(template.next_run, Some(at));
        assert_eq!(template.missed_policy, MissedPolicy::CatchUp);

        template.mark_materialized(at).unwrap();
        assert!(!template.enabled);
        assert!(template.next_run.is_none());
        assert_eq!(template.execution_count, 1);
        // Repeated polls have nothing to fire.
        assert!(!template.is_due(at + Duration::hours(1)));
    }

    #[test]
    fn max_runs_cap_disables() {
        let mut schedule = interval(60);
        schedule.max_runs = 2;
        let mut template = template(schedule);
        let now = Utc::now();
        template.mark_materialized(now).unwrap();
        assert!(template.enabled);
        template.mark_materialized(now + Duration::seconds(60)).unwrap();
        assert!(!template.enabled);
        assert!(template.next_run.is_none());
    }

    #[test]
    fn end_date_cap_disables() {
        let mut schedule = interval(3600);
        let now = Utc::now();
        schedule.end_date = Some(now + Duration::minutes(30));
        let mut template = template(schedule);
        template.mark_materialized(now).unwrap();
        assert!(!template.enabled);
    }

    #[test]
    fn consecutive_failures_disable_after_threshold() {
        let mut template = template(interval(60));
        let mut now = Utc::now();
        for _ in 0..DEFAULT_FAILURE_DISABLE_THRESHOLD - 1 {
            template
                .mark_failed("boom", now, DEFAULT_FAILURE_DISABLE_THRESHOLD)
                .unwrap();
            now += Duration::seconds(60);
        }
        assert!(template.enabled);
        template
            .mark_failed("boom", now, DEFAULT_FAILURE_DISABLE_THRESHOLD)
            .unwrap();
        assert!(!template.enabled);
        assert_eq!(template.failure_count, DEFAULT_FAILURE_DISABLE_THRESHOLD);
        assert_eq!(template.execution_count, 0);
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let mut template = template(interval(60));
        let now = Utc::now();
        template.mark_failed("boom", now, 5).unwrap();
        template.mark_materialized(now + Duration::seconds(60)).unwrap();
        assert_eq!(template.consecutive_failures, 0);
        assert_eq!(template.failure_count, 1);
    }

    #[test]
    fn missed_one_shot_with_skip_policy_is_dropped() {
        let past = Utc::now() - Duration::hours(2);
        let mut template = template(ScheduleKind::Once { execute_at: past }.into());
        template.missed_policy = MissedPolicy::Skip;
        template.apply_missed_policy(Utc::now());
        assert!(!template.enabled);
        assert!(template.next_run.is_none());
    }

    #[test]
    fn missed_recurring_with_skip_stays_due_once() {
        let mut template = template(interval(3600));
        template.next_run = Some(utc("2025-11-01T01:00:00Z"));
        template.last_run = Some(utc("2025-11-01T00:00:00Z"));
        let now = utc("2025-11-01T05:30:00Z");
        template.apply_missed_policy(now);
        assert!(template.is_due(now));
        template.mark_materialized(now).unwrap();
        assert_eq!(template.next_run, Some(utc("2025-11-01T06:00:00Z")));
        assert_eq!(template.execution_count, 1);
    }

    #[test]
    fn cron_parses_and_matches() {
        let expr = CronExpr::parse("30 9 * * 1-5").unwrap();
        // Friday 2025-11-07 08:00 → same day 09:30.
        assert_eq!(
            expr.next_match(utc("2025-11-07T08:00:00Z")),
            Some(utc("2025-11-07T09:30:00Z"))
        );
        // Saturday skips to Monday.
        assert_eq!(
            expr.next_match(utc("2025-11-08T10:00:00Z")),
            Some(utc("2025-11-10T09:30:00Z"))
        );
    }

    #[test]
    fn cron_next_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        assert_eq!(
            expr.next_match(utc("2025-11-01T09:00:00Z")),
            Some(utc("2025-11-01T10:00:00Z"))
        );
    }

    #[test]
    fn cron_steps_and_lists() {
        let expr = CronExpr::parse("*/15 0,12 1 * *").unwrap();
        assert_eq!(
            expr.next_match(utc("2025-11-01T00:20:00Z")),
            Some(utc("2025-11-01T00:30:00Z"))
        );
        assert_eq!(
            expr.next_match(utc("2025-11-01T12:46:00Z")),
            Some(utc("2025-12-01T00:00:00Z"))
        );
    }

    #[test]
    fn cron_dom_dow_either_rule() {
        // Both restricted: the 1st of the month OR any Monday.
        let expr = CronExpr::parse("0 9 1 * 1").unwrap();
        // 2025-11-02 is a Sunday; next match is Monday the 3rd.
        assert_eq!(
            expr.next_match(utc("2025-11-02T00:00:00Z")),
            Some(utc("2025-11-03T09:00:00Z"))
        );
        // After the 3rd: Monday the 10th beats December 1st.
        assert_eq!(
            expr.next_match(utc("2025-11-03T10:00:00Z")),
            Some(utc("2025-11-10T09:00:00Z"))
        );
    }

    #[test]
    fn bad_cron_expressions_are_rejected() {
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn schedule_serde_round_trip() {
        let schedule = ScheduleConfig {
            kind: ScheduleKind::Daily {
                time_of_day: "09:00".to_string(),
                timezone: Some("UTC".to_string()),
            },
            max_runs: 10,
            end_date: None,
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], "daily");
        assert_eq!(json["max_runs"], 10);
        let back: ScheduleConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }
}
