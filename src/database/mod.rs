use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Row};

use crate::error::AppError;

/// Pooled Postgres access for route handlers.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET application_name = 'tolcprep_backend';")
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round trip on one pooled connection, released when this returns.
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT 1 AS ok").fetch_one(&mut *conn).await?;
        let ok: i32 = row.try_get("ok")?;
        if ok != 1 {
            return Err(AppError::InternalServerError);
        }
        Ok(())
    }
}
