//! ABOUTME: Cron engine firing due schedules and the syncer reconciling them
//! ABOUTME: Schedules come from flow declarations and user-created entries

pub mod engine;
pub mod schedule;
pub mod sync;

pub use engine::{CronEngine, CronEntry, EntryIdentity};
pub use schedule::{next_fire, parse_schedule, parse_timezone, validate_expression};
pub use sync::{CronSyncer, ScheduleSource, ScheduledFlow, SyncReport};
