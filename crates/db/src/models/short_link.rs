//! Durable `task_id -> result_url` projection.

use mvstudio_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `video_short_links` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VideoShortLink {
    pub task_id: String,
    pub result_url: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
