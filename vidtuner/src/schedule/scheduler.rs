use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{ScheduleEntry, SwitchEvent};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::SchedulerConfig;

/**
    What a single scheduler tick decided.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Entry that fired this tick, if any
    pub fired: Option<SwitchEvent>,
    /// Entries that became due after their play window had already passed
    pub expired: Vec<ScheduleEntry>,
}

/**
    Evaluates a working set of schedule entries against wall-clock time
    and publishes a [`SwitchEvent`] when one becomes due.

    Each entry moves from pending to due once `scheduled_at - now` is within
    the due window, and is removed from the working set right away. A due
    entry fires if `now` is still within `scheduled_at + play_window`,
    otherwise it is dropped silently. At most one entry fires per tick.
*/
pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    due_window: TimeDelta,
    play_window: TimeDelta,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        mut entries: Vec<ScheduleEntry>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        // Stable sort keeps file order for identical timestamps
        entries.sort_by_key(|entry| entry.scheduled_at);

        Self {
            entries,
            bus,
            clock,
            due_window: config.due_window(),
            play_window: config.play_window(),
            tick_interval: config.tick_interval(),
        }
    }

    /**
        Entries that have not become due yet, in chronological order.
    */
    pub fn pending(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /**
        Decide which entries are due at `now`, removing them from the working set.

        This does not publish anything.
    */
    pub fn evaluate(&mut self, now: NaiveDateTime) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        let mut index = 0;
        while index < self.entries.len() {
            let lead = self.entries[index].scheduled_at - now;
            if lead > self.due_window {
                index += 1;
                continue;
            }

            let entry = self.entries.remove(index);
            // A deadline past chrono's range is still in the future
            let playable = entry
                .scheduled_at
                .checked_add_signed(self.play_window)
                .is_none_or(|deadline| now <= deadline);
            if playable {
                outcome.fired = Some(entry.into());
                break;
            }
            outcome.expired.push(entry);
        }

        outcome
    }

    /**
        Run one tick against the clock and publish the fired entry, if any.
    */
    pub fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        let outcome = self.evaluate(now);

        for entry in &outcome.expired {
            debug!(
                channel = %entry.channel,
                scheduled_at = %entry.scheduled_at,
                "schedule entry expired"
            );
        }

        if let Some(event) = &outcome.fired {
            info!(
                channel = %event.channel,
                scheduled_at = %event.scheduled_at,
                remaining = self.entries.len(),
                "schedule entry fired"
            );
            self.bus.publish(event.clone());
        }

        outcome
    }

    /**
        Move the scheduler onto its own timer task.

        The timer starts out stopped, call [`SchedulerHandle::start`] to begin ticking.
    */
    pub fn spawn(self) -> SchedulerHandle {
        let (running_tx, running_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(running_rx, cancel.clone()));

        SchedulerHandle {
            running_tx,
            cancel,
            task,
        }
    }

    async fn run(
        mut self,
        mut running_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !*running_rx.borrow_and_update() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = running_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        interval.reset_immediately();
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = running_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                        error!("scheduler tick panicked");
                    }
                }
            }
        }

        debug!(remaining = self.entries.len(), "scheduler stopped");
        self
    }
}

/**
    Control handle for a spawned [`Scheduler`].
*/
pub struct SchedulerHandle {
    running_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    task: JoinHandle<Scheduler>,
}

impl SchedulerHandle {
    /**
        Start (or resume) ticking. Loaded entries are kept across stop/start.
    */
    pub fn start(&self) {
        self.running_tx.send_replace(true);
    }

    /**
        Pause ticking without discarding any entries.
    */
    pub fn stop(&self) {
        self.running_tx.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow() && !self.cancel.is_cancelled()
    }

    /**
        Stop the timer for good, no further ticks will occur.
    */
    pub fn dispose(&self) {
        self.running_tx.send_replace(false);
        self.cancel.cancel();
    }

    /**
        Dispose the timer and wait for its task, returning the scheduler
        with whatever entries never became due.
    */
    pub async fn join(self) -> Option<Scheduler> {
        self.dispose();
        match self.task.await {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                error!("scheduler task failed: {e}");
                None
            }
        }
    }
}
