// ==== Ingestion ====
/// Counter for records written for the first time, labelled by topic
pub const RECORDS_INSERTED: &str = "analytics_records_inserted_total";

/// Counter for records whose natural key was already stored
pub const RECORDS_DUPLICATE: &str = "analytics_records_duplicate_total";

/// Counter for payloads refused before reaching the store, labelled by reason
pub const RECORDS_REJECTED: &str = "analytics_records_rejected_total";

/// Counter for store writes that failed
pub const RECORDS_STORE_FAILED: &str = "analytics_records_store_failed_total";

/// Histogram for time spent handling one message, seconds
pub const MESSAGE_HANDLING_DURATION: &str = "analytics_message_handling_duration_seconds";

// ==== Streaming consumer ====
pub const OFFSET_STORE_FAILED: &str = "analytics_offset_store_failed_total";
pub const CONSUMER_RECV_ERRORS: &str = "analytics_consumer_recv_errors_total";

// ==== Backfill ====
pub const BACKFILL_RUNS: &str = "analytics_backfill_runs_total";
pub const BACKFILL_INSERTED: &str = "analytics_backfill_inserted_total";
pub const BACKFILL_PARTITION_ERRORS: &str = "analytics_backfill_partition_errors_total";
