use crate::store::{BatchUpdate, ScanStore, ScanUpdate};
use crate::{Batch, Scan};
use anyhow::{anyhow, ensure, Error};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL backed scan and batch records.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    /// Inserts a pending batch with one pending scan per URL.
    pub async fn create_batch(
        &self,
        user_id: &str,
        urls: &[String],
    ) -> Result<(Batch, Vec<Scan>), Error> {
        ensure!(!urls.is_empty(), "a batch needs at least one url");
        debug!("Creating batch of {} urls", urls.len());
        let batch = Batch::new(user_id, urls.len() as i64);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batches (id, user_id, total_urls, status) \
            VALUES ($1, $2, $3, 'pending')",
        )
        .bind(batch.id)
        .bind(&batch.user_id)
        .bind(batch.total_urls)
        .execute(&mut *tx)
        .await?;

        let mut scans = Vec::with_capacity(urls.len());
        for url in urls {
            let scan = Scan::new(url.as_str(), user_id, Some(batch.id));
            sqlx::query(
                "INSERT INTO scans (id, batch_id, url, user_id, status) \
                VALUES ($1, $2, $3, $4, 'pending')",
            )
            .bind(scan.id)
            .bind(scan.batch_id)
            .bind(&scan.url)
            .bind(&scan.user_id)
            .execute(&mut *tx)
            .await?;
            scans.push(scan);
        }

        tx.commit().await?;
        Ok((batch, scans))
    }
}

#[async_trait]
impl ScanStore for DbHandle {
    async fn update_scan(&self, id: Uuid, update: ScanUpdate) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE scans \
                SET status = $1, \
                results = COALESCE($2, results), \
                issues_found = COALESCE($3, issues_found), \
                error = $4, \
                updated_at = now() \
            WHERE id = $5",
        )
        .bind(update.status)
        .bind(update.results)
        .bind(update.issues_found)
        .bind(update.error)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("scan {} not found", id));
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, Error> {
        Ok(sqlx::query_as::<_, Batch>(
            "SELECT id, user_id, total_urls, completed_urls, failed_urls, status, completed_at, notified \
            FROM batches \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn batch_scans(&self, batch_id: Uuid) -> Result<Vec<Scan>, Error> {
        Ok(sqlx::query_as::<_, Scan>(
            "SELECT id, url, user_id, batch_id, status, results, issues_found, error \
            FROM scans \
            WHERE batch_id = $1 \
            ORDER BY created_at asc",
        )
        .bind(batch_id)
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE batches \
                SET completed_urls = $1, \
                failed_urls = $2, \
                status = $3, \
                completed_at = COALESCE(completed_at, $4) \
            WHERE id = $5",
        )
        .bind(update.completed_urls)
        .bind(update.failed_urls)
        .bind(update.status)
        .bind(update.completed_at)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("batch {} not found", id));
        }
        Ok(())
    }

    async fn mark_batch_notified(&self, id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE batches \
                SET notified = TRUE \
            WHERE id = $1 AND notified = FALSE",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
