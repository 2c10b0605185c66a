pub const POINTS_WRITTEN: &str = "history_migrator_points_written";
pub const BATCHES_SENT: &str = "history_migrator_batches_sent";
pub const WRITE_RETRIES: &str = "history_migrator_write_retries";
pub const WRITE_FAILURES: &str = "history_migrator_write_failures";
pub const RECORDS_SKIPPED: &str = "history_migrator_records_skipped";
pub const RECORDS_FILTERED: &str = "history_migrator_records_filtered";
pub const DAYS_COMMITTED: &str = "history_migrator_days_committed";
pub const SOURCE_ROWS_DECODED: &str = "history_migrator_source_rows_decoded";
