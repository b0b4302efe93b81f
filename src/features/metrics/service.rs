use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::Request, middleware::Next, response::Response, Extension};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

const FLUSH_THRESHOLD: usize = 100;
const FLUSH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: i64,
    pub at: DateTime<Utc>,
}

/// Buffered request metrics. A periodic flusher writes batches to
/// `_request_metrics` in one transaction; a final flush runs on shutdown.
#[derive(Clone)]
pub struct MetricsService {
    pool: SqlitePool,
    enabled: bool,
    buffer: Arc<Mutex<Vec<RequestMetric>>>,
}

impl MetricsService {
    pub fn new(pool: SqlitePool, enabled: bool) -> Self {
        Self {
            pool,
            enabled,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn record(&self, metric: RequestMetric) {
        if !self.enabled {
            return;
        }
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(metric);
            buffer.len() >= FLUSH_THRESHOLD
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                tracing::error!(error = %e, "Metrics flush failed");
            }
        }
    }

    pub async fn flush(&self) -> Result<usize, sqlx::Error> {
        let batch: Vec<RequestMetric> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for metric in &batch {
            sqlx::query(
                "INSERT INTO _request_metrics (method, path, status, duration_ms, at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&metric.method)
            .bind(&metric.path)
            .bind(i64::from(metric.status))
            .bind(metric.duration_ms)
            .bind(metric.at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(batch.len())
    }

    pub async fn run_flusher(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = self.flush().await {
                tracing::error!(error = %e, "Metrics flush failed");
            }
        }
    }
}

pub async fn metrics_middleware(
    Extension(metrics): Extension<MetricsService>,
    request: Request,
    next: Next,
) -> Response {
    if !metrics.enabled() {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    metrics
        .record(RequestMetric {
            method,
            path,
            status: response.status().as_u16(),
            duration_ms: started.elapsed().as_millis() as i64,
            at: Utc::now(),
        })
        .await;

    response
}
