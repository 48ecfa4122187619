//! ABOUTME: Repository modules for durable weft state
//! ABOUTME: One repository per table group, runtime-checked queries

pub mod approvals;
pub mod cron_schedules;
pub mod executions;
pub mod flows;
pub mod nodes;
pub mod secrets;
