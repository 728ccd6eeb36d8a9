//! Slot resolution: weekly schedule → bookable appointment times for a day.
//!
//! Everything here is a pure function of its inputs. Storage, the clock and
//! configuration are the caller's business.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Default granularity at which appointments are offered (minutes).
pub const DEFAULT_SLOT_DURATION_MIN: u32 = 40;

// ── Time helpers ──

/// Parse a time-of-day, accepting "HH:MM", "HH:MM:SS" and "HH:MM:SS.fff".
/// Seconds are dropped: slots live at minute precision.
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
}

/// Format a time as "HH:MM".
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Canonical "HH:MM" form of a stored time. Unparsable input is returned
/// trimmed, so it can never collide with a generated slot.
pub fn normalize_time(raw: &str) -> String {
    parse_time(raw)
        .map(format_time)
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Serde adapter for `NaiveTime` as "HH:MM".
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_time(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time: {raw}")))
    }
}

// ── Schedule ──

/// One contiguous open period of a day (e.g. the morning before lunch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBlock {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeBlock {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build a block from "HH:MM" strings.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self::new(parse_time(start)?, parse_time(end)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("day of week {0} is out of range (0 = Sunday … 6 = Saturday)")]
    InvalidDay(u8),
    #[error("day {day}: block {start}–{end} must start before it ends")]
    InvertedBlock { day: u8, start: String, end: String },
    #[error("day {day}: blocks overlap or are out of order at {at}")]
    Overlap { day: u8, at: String },
}

/// Day of week (0 = Sunday) → ordered open blocks. Missing days are closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule {
    days: BTreeMap<u8, Vec<TimeBlock>>,
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the blocks for one day, replacing whatever was there.
    pub fn with_day(mut self, day: u8, blocks: Vec<TimeBlock>) -> Self {
        self.set_day(day, blocks);
        self
    }

    pub fn set_day(&mut self, day: u8, blocks: Vec<TimeBlock>) {
        self.days.insert(day, blocks);
    }

    /// Blocks for a day of week; empty when the shop is closed.
    pub fn blocks_for_day(&self, day: u8) -> &[TimeBlock] {
        self.days.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Blocks for the weekday of a calendar date.
    pub fn blocks_for(&self, date: NaiveDate) -> &[TimeBlock] {
        self.blocks_for_day(date.weekday().num_days_from_sunday() as u8)
    }

    /// Iterate `(day, blocks)` in day order.
    pub fn days(&self) -> impl Iterator<Item = (u8, &[TimeBlock])> {
        self.days.iter().map(|(d, b)| (*d, b.as_slice()))
    }

    /// Mon–Fri 09:00–13:00 and 15:00–20:00, Sat 09:00–14:00, Sun closed.
    pub fn default_shop() -> Self {
        let weekday = || {
            vec![
                TimeBlock::new(hm(9, 0), hm(13, 0)),
                TimeBlock::new(hm(15, 0), hm(20, 0)),
            ]
        };
        (1..=5)
            .fold(Self::new(), |schedule, day| schedule.with_day(day, weekday()))
            .with_day(6, vec![TimeBlock::new(hm(9, 0), hm(14, 0))])
    }

    /// Validation applied when the schedule is edited; slot generation
    /// trusts whatever passed here.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (&day, blocks) in &self.days {
            if day > 6 {
                return Err(ScheduleError::InvalidDay(day));
            }
            for block in blocks {
                if block.start >= block.end {
                    return Err(ScheduleError::InvertedBlock {
                        day,
                        start: format_time(block.start),
                        end: format_time(block.end),
                    });
                }
            }
            for pair in blocks.windows(2) {
                if pair[1].start < pair[0].end {
                    return Err(ScheduleError::Overlap {
                        day,
                        at: format_time(pair[1].start),
                    });
                }
            }
        }
        Ok(())
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

// ── Vacations ──

/// Inclusive range of dates on which the shop is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VacationBlock {
    pub id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: String,
}

impl VacationBlock {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

// ── Resolver ──

/// All slots of a date, in block order.
///
/// A slot is emitted only while `start + duration <= block.end`, so the last
/// appointment of a block never runs past it. Slots never wrap midnight.
pub fn generate_day_slots(
    date: NaiveDate,
    schedule: &WeeklySchedule,
    slot_duration_min: u32,
) -> Vec<String> {
    if slot_duration_min == 0 {
        return Vec::new();
    }
    let step = Duration::minutes(i64::from(slot_duration_min));

    let mut slots = Vec::new();
    for block in schedule.blocks_for(date) {
        let mut current = block.start;
        loop {
            let (slot_end, wrapped) = current.overflowing_add_signed(step);
            if wrapped != 0 || slot_end > block.end {
                break;
            }
            slots.push(format_time(current));
            current = slot_end;
        }
    }
    slots
}

/// True if `date` lies inside any vacation (both ends inclusive).
pub fn is_date_fully_blocked(date: NaiveDate, vacations: &[VacationBlock]) -> bool {
    vacations.iter().any(|v| v.contains(date))
}

/// `all_slots - booked - blocked`, compared at minute precision.
/// Order of `all_slots` is preserved.
pub fn resolve_available_slots<B, K>(all_slots: &[String], booked: &[B], blocked: &[K]) -> Vec<String>
where
    B: AsRef<str>,
    K: AsRef<str>,
{
    let taken: HashSet<String> = booked
        .iter()
        .map(|t| normalize_time(t.as_ref()))
        .chain(blocked.iter().map(|t| normalize_time(t.as_ref())))
        .collect();

    all_slots
        .iter()
        .filter(|slot| !taken.contains(&normalize_time(slot)))
        .cloned()
        .collect()
}

/// True only for slots of today that start strictly before `now`.
/// Other dates are never "past" here; the calendar cutoff handles them.
pub fn is_slot_in_past(date: NaiveDate, time: &str, now: NaiveDateTime) -> bool {
    if date != now.date() {
        return false;
    }
    parse_time(time).is_some_and(|t| date.and_time(t) < now)
}

/// Availability of one date, as served to the booking UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    /// Vacation day or weekday without blocks.
    pub closed: bool,
    pub vacation: bool,
    /// Every slot of the day before filtering.
    pub slots: Vec<String>,
    /// Slots a customer may book right now.
    pub available: Vec<String>,
}

/// Inputs for [`resolve_day`] that come from storage.
pub struct DayInputs<'a, B, K> {
    pub vacations: &'a [VacationBlock],
    pub booked: &'a [B],
    pub blocked: &'a [K],
}

/// Run the whole pipeline for one date: vacation short-circuit, slot
/// generation, booked/blocked subtraction, past-slot removal.
pub fn resolve_day<B, K>(
    date: NaiveDate,
    schedule: &WeeklySchedule,
    slot_duration_min: u32,
    inputs: DayInputs<'_, B, K>,
    now: NaiveDateTime,
) -> DayAvailability
where
    B: AsRef<str>,
    K: AsRef<str>,
{
    if is_date_fully_blocked(date, inputs.vacations) {
        return DayAvailability {
            date,
            closed: true,
            vacation: true,
            slots: Vec::new(),
            available: Vec::new(),
        };
    }

    let slots = generate_day_slots(date, schedule, slot_duration_min);
    let available = resolve_available_slots(&slots, inputs.booked, inputs.blocked)
        .into_iter()
        .filter(|slot| !is_slot_in_past(date, slot, now))
        .collect();

    DayAvailability {
        date,
        closed: slots.is_empty(),
        vacation: false,
        slots,
        available,
    }
}

// ── Tests ──
