/// Opaque job identifier (UUID v7 rendered as a string).
pub type JobId = String;

/// UTC timestamp used on every job record.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7().to_string()
}
