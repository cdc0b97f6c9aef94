pub mod recurrence;
pub mod retry;
pub mod time;
