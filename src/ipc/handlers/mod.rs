pub mod assessments;
pub mod attempts;
pub mod core;
pub mod cron;
pub mod grading;
pub mod layout;
pub mod overrides;
pub mod stats;
