use chrono::Local;
use serde::Serialize;

/// Words that mark a user message as workout-related.
const TRIGGER_KEYWORDS: [&str; 2] = ["workout", "exercise"];

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkoutRecord {
    pub timestamp: String,
    pub query: String,
    pub response: String,
}

impl WorkoutRecord {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            query: query.into(),
            response: response.into(),
        }
    }
}

/// Case-insensitive substring match against the trigger keywords.
pub fn is_workout_query(query: &str) -> bool {
    let lowercase = query.to_lowercase();
    TRIGGER_KEYWORDS.iter().any(|keyword| lowercase.contains(keyword))
}

/// Builds the record for a completed turn, or `None` when the query doesn't qualify.
pub fn track_turn(query: &str, response: &str) -> Option<WorkoutRecord> {
    is_workout_query(query).then(|| WorkoutRecord::new(query, response))
}
