//! Notification windows.
//!
//! A schedule enables whole weekdays and a daily `[start, end]` window in
//! local minutes. Clipping only ever moves a timestamp forward to the start of
//! the next allowed window.

use herald_common::types::ScheduleData;

const SECONDS_PER_DAY: i64 = 86_400;
const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Upper bound on alternating clips across several schedules.
const MAX_CLIP_ROUNDS: usize = 16;

fn day_enabled(schedule: &ScheduleData, day_number: i64) -> bool {
    // 1970-01-01 was a Thursday
    let name = WEEKDAYS[(day_number + 3).rem_euclid(7) as usize];
    schedule
        .days
        .iter()
        .any(|d| d.enabled && d.name.eq_ignore_ascii_case(name))
}

/// Earliest timestamp `>= timestamp` inside an allowed window, or `None`
/// when the schedule enables no day at all.
pub fn next_allowed(schedule: &ScheduleData, timestamp: i64) -> Option<i64> {
    let tz_shift = schedule.tz_offset * 60;
    let local = timestamp - tz_shift;
    let today = local.div_euclid(SECONDS_PER_DAY);
    let start = schedule.start_offset * 60;
    let mut end = schedule.end_offset * 60;
    if end < start {
        end += SECONDS_PER_DAY;
    }

    // Yesterday's window can wrap into today.
    for day in today - 1..=today + 7 {
        if !day_enabled(schedule, day) {
            continue;
        }
        let window_start = day * SECONDS_PER_DAY + start;
        let window_end = day * SECONDS_PER_DAY + end;
        if local <= window_end {
            return Some(local.max(window_start) + tz_shift);
        }
    }
    None
}

/// Push `send_after` forward until every schedule allows it.
///
/// Schedules that enable no day are ignored.
pub fn clip_send_after(send_after: i64, schedules: &[&ScheduleData]) -> i64 {
    let mut clipped = send_after;
    for _ in 0..MAX_CLIP_ROUNDS {
        let mut moved = false;
        for schedule in schedules {
            match next_allowed(schedule, clipped) {
                Some(next) if next > clipped => {
                    clipped = next;
                    moved = true;
                }
                Some(_) => {}
                None => {
                    tracing::warn!("Schedule enables no weekday, ignoring it");
                }
            }
        }
        if !moved {
            return clipped;
        }
    }
    tracing::warn!(
        send_after,
        clipped,
        "Schedules share no common window, using last candidate"
    );
    clipped
}
