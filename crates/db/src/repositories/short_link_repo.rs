//! Repository for the `video_short_links` table.

use sqlx::{PgExecutor, PgPool};

use crate::models::short_link::VideoShortLink;

const COLUMNS: &str = "task_id, result_url, created_at, updated_at";

pub struct ShortLinkRepo;

impl ShortLinkRepo {
    /// Insert or replace the URL for a task, bumping `updated_at`.
    pub async fn upsert<'e, E: PgExecutor<'e>>(
        executor: E,
        task_id: &str,
        result_url: &str,
    ) -> Result<VideoShortLink, sqlx::Error> {
        let query = format!(
            "INSERT INTO video_short_links (task_id, result_url) \
             VALUES ($1, $2) \
             ON CONFLICT (task_id) DO UPDATE \
             SET result_url = EXCLUDED.result_url, updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, VideoShortLink>(&query)
            .bind(task_id)
            .bind(result_url)
            .fetch_one(executor)
            .await
    }

    pub async fn find(pool: &PgPool, task_id: &str) -> Result<Option<VideoShortLink>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM video_short_links WHERE task_id = $1");
        sqlx::query_as::<_, VideoShortLink>(&query)
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }
}
