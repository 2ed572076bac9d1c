mod loader;
mod scheduler;

use chrono::NaiveDateTime;

use crate::channel::Channel;

pub use self::loader::{ScheduleError, TIMESTAMP_FORMAT, load_schedule, parse_schedule};
pub use self::scheduler::{Scheduler, SchedulerHandle, TickOutcome};

/**
    A planned switch to `channel` at local time `scheduled_at`.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub scheduled_at: NaiveDateTime,
    pub channel: Channel,
}

impl ScheduleEntry {
    pub fn new(scheduled_at: NaiveDateTime, channel: Channel) -> Self {
        Self {
            scheduled_at,
            channel,
        }
    }
}

/**
    Published on the event bus when a schedule entry fires.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub scheduled_at: NaiveDateTime,
    pub channel: Channel,
}

impl From<ScheduleEntry> for SwitchEvent {
    fn from(entry: ScheduleEntry) -> Self {
        Self {
            scheduled_at: entry.scheduled_at,
            channel: entry.channel,
        }
    }
}
