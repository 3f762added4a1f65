//! PostgreSQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use super::{DoingFilter, SchedulerStore, TaskStore, UpsertErrors};
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{
    task_host_table, ActionKind, DoingAction, HostStatus, MarkDone, TaskAction, TaskHost,
    TaskHostDoing, TaskMeta, TASK_HOST_SHARDS,
};

const BASE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_meta (
        id BIGSERIAL PRIMARY KEY,
        title VARCHAR(255) NOT NULL DEFAULT '',
        account VARCHAR(64) NOT NULL,
        batch INT NOT NULL DEFAULT 0,
        tolerance INT NOT NULL DEFAULT 0,
        timeout INT NOT NULL DEFAULT 0,
        pause VARCHAR(255) NOT NULL DEFAULT '',
        script TEXT NOT NULL,
        args VARCHAR(512) NOT NULL DEFAULT '',
        stdin VARCHAR(1024) NOT NULL DEFAULT '',
        creator VARCHAR(64) NOT NULL DEFAULT '',
        created TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_meta_created ON task_meta (created)",
    r#"
    CREATE TABLE IF NOT EXISTS task_action (
        id BIGINT PRIMARY KEY,
        action VARCHAR(32) NOT NULL,
        clock BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_scheduler (
        id BIGINT PRIMARY KEY,
        scheduler VARCHAR(128) NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_scheduler_scheduler ON task_scheduler (scheduler)",
    r#"
    CREATE TABLE IF NOT EXISTS task_scheduler_health (
        scheduler VARCHAR(128) NOT NULL UNIQUE,
        clock BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_scheduler_health_clock ON task_scheduler_health (clock)",
    r#"
    CREATE TABLE IF NOT EXISTS task_host_doing (
        id BIGINT NOT NULL,
        host VARCHAR(128) NOT NULL,
        clock BIGINT NOT NULL DEFAULT 0,
        action VARCHAR(16) NOT NULL,
        UNIQUE (id, host)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_host_doing_id ON task_host_doing (id)",
    "CREATE INDEX IF NOT EXISTS idx_task_host_doing_host ON task_host_doing (host)",
];

/// Create every table idempotently, including the `task_host_NN` shards.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in BASE_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    for shard in 0..TASK_HOST_SHARDS {
        let table = task_host_table(shard);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                ii BIGSERIAL PRIMARY KEY,
                id BIGINT NOT NULL,
                host VARCHAR(128) NOT NULL,
                status VARCHAR(32) NOT NULL,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                UNIQUE (id, host)
            )
            "#
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    tracing::info!(shards = TASK_HOST_SHARDS, "Store schema ready");
    Ok(())
}

/// Store backed by PostgreSQL through `sqlx`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then make sure the schema exists.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn meta_from_row(row: &PgRow) -> TaskMeta {
    TaskMeta {
        id: row.get("id"),
        title: row.get("title"),
        account: row.get("account"),
        batch: row.get("batch"),
        tolerance: row.get("tolerance"),
        timeout: row.get("timeout"),
        pause: row.get("pause"),
        script: row.get("script"),
        args: row.get("args"),
        stdin: row.get("stdin"),
        creator: row.get("creator"),
        created_at: row.get("created"),
    }
}

fn host_from_row(row: &PgRow) -> Result<TaskHost> {
    let status: String = row.get("status");
    Ok(TaskHost {
        id: row.get("id"),
        host: row.get("host"),
        status: status.parse()?,
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
    })
}

fn doing_from_row(row: &PgRow) -> Result<TaskHostDoing> {
    let action: String = row.get("action");
    Ok(TaskHostDoing::new(
        row.get::<i64, _>("id"),
        row.get::<String, _>("host"),
        row.get::<i64, _>("clock"),
        action.parse()?,
    ))
}

fn push_doing_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a DoingFilter) {
    builder.push(" WHERE TRUE");
    if let Some(id) = filter.id {
        builder.push(" AND id = ").push_bind(id);
    }
    if let Some(host) = filter.host.as_deref() {
        builder.push(" AND host = ").push_bind(host);
    }
    if let Some(clock) = filter.clock {
        builder.push(" AND clock = ").push_bind(clock);
    }
}

const INSERT_META: &str = r#"
    INSERT INTO task_meta
        (title, account, batch, tolerance, timeout, pause, script, args, stdin, creator, created)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING id
"#;

fn upsert_host_sql(id: i64) -> String {
    format!(
        r#"
        INSERT INTO {} (id, host, status, stdout, stderr)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id, host)
        DO UPDATE SET status = EXCLUDED.status, stdout = EXCLUDED.stdout, stderr = EXCLUDED.stderr
        "#,
        task_host_table(id)
    )
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn create_task_meta(&self, meta: &TaskMeta) -> Result<i64> {
        let row = sqlx::query(INSERT_META)
            .bind(&meta.title)
            .bind(&meta.account)
            .bind(meta.batch)
            .bind(meta.tolerance)
            .bind(meta.timeout)
            .bind(&meta.pause)
            .bind(&meta.script)
            .bind(&meta.args)
            .bind(&meta.stdin)
            .bind(&meta.creator)
            .bind(meta.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    async fn task_meta(&self, id: i64) -> Result<Option<TaskMeta>> {
        let row = sqlx::query("SELECT * FROM task_meta WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(meta_from_row))
    }

    async fn upsert_task_host(&self, host: &TaskHost) -> Result<()> {
        sqlx::query(&upsert_host_sql(host.id))
            .bind(host.id)
            .bind(&host.host)
            .bind(host.status.as_str())
            .bind(&host.stdout)
            .bind(&host.stderr)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_task_hosts(&self, hosts: &[TaskHost]) -> Result<UpsertErrors> {
        if hosts.is_empty() {
            return Err(DispatchError::validation("empty list"));
        }
        let mut errors = HashMap::new();
        for host in hosts {
            if let Err(err) = self.upsert_task_host(host).await {
                errors.insert(host.key(), err.to_string());
            }
        }
        Ok(errors)
    }

    async fn doing_records(&self, filter: &DoingFilter) -> Result<Vec<TaskHostDoing>> {
        let mut builder = QueryBuilder::new("SELECT id, host, clock, action FROM task_host_doing");
        push_doing_filter(&mut builder, filter);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(doing_from_row).collect()
    }

    async fn count_doing(&self, filter: &DoingFilter) -> Result<u64> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS n FROM task_host_doing");
        push_doing_filter(&mut builder, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn mark_done(&self, done: &MarkDone) -> Result<()> {
        let table = task_host_table(done.id);
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM task_host_doing WHERE id = $1 AND host = $2 AND clock = $3",
        )
        .bind(done.id)
        .bind(&done.host)
        .bind(done.clock)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted > 0 {
            sqlx::query(&format!(
                "UPDATE {table} SET status = $1, stdout = $2, stderr = $3 WHERE id = $4 AND host = $5"
            ))
            .bind(done.status.as_str())
            .bind(&done.stdout)
            .bind(&done.stderr)
            .bind(done.id)
            .bind(&done.host)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(&format!(
                "UPDATE {table} SET stdout = $1, stderr = $2 WHERE id = $3 AND host = $4 AND status = $5"
            ))
            .bind(&done.stdout)
            .bind(&done.stderr)
            .bind(done.id)
            .bind(&done.host)
            .bind(HostStatus::Timeout.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_output(&self, id: i64, host: &str, stdout: &str, stderr: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET stdout = $1, stderr = $2 WHERE id = $3 AND host = $4",
            task_host_table(id)
        ))
        .bind(stdout)
        .bind(stderr)
        .bind(id)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for PostgresStore {
    async fn heartbeat(&self, scheduler: &str, clock: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_scheduler_health (scheduler, clock)
            VALUES ($1, $2)
            ON CONFLICT (scheduler) DO UPDATE SET clock = EXCLUDED.clock
            "#,
        )
        .bind(scheduler)
        .bind(clock)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_schedulers(&self, before_clock: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT scheduler FROM task_scheduler_health WHERE clock < $1 ORDER BY scheduler",
        )
        .bind(before_clock)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("scheduler")).collect())
    }

    async fn delete_scheduler_health(&self, scheduler: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_scheduler_health WHERE scheduler = $1")
            .bind(scheduler)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn tasks_of_scheduler(&self, scheduler: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM task_scheduler WHERE scheduler = $1 ORDER BY id")
            .bind(scheduler)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn orphan_task_ids(&self) -> Result<Vec<i64>> {
        self.tasks_of_scheduler("").await
    }

    async fn take_over_task(&self, id: i64, expected: &str, owner: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE task_scheduler SET scheduler = $1 WHERE id = $2 AND scheduler = $3")
                .bind(owner)
                .bind(id)
                .bind(expected)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_task(
        &self,
        meta: &TaskMeta,
        hosts: &[String],
        action: ActionKind,
        clock: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(INSERT_META)
            .bind(&meta.title)
            .bind(&meta.account)
            .bind(meta.batch)
            .bind(meta.tolerance)
            .bind(meta.timeout)
            .bind(&meta.pause)
            .bind(&meta.script)
            .bind(&meta.args)
            .bind(&meta.stdin)
            .bind(&meta.creator)
            .bind(meta.created_at)
            .fetch_one(&mut *tx)
            .await?;
        let id: i64 = row.get("id");

        sqlx::query("INSERT INTO task_scheduler (id, scheduler) VALUES ($1, '')")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO task_action (id, action, clock) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(action.as_str())
            .bind(clock)
            .execute(&mut *tx)
            .await?;

        let insert_host = format!(
            "INSERT INTO {} (id, host, status) VALUES ($1, $2, $3)",
            task_host_table(id)
        );
        for host in hosts.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
            sqlx::query(&insert_host)
                .bind(id)
                .bind(host)
                .bind(HostStatus::Waiting.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn task_action(&self, id: i64) -> Result<Option<TaskAction>> {
        let row = sqlx::query("SELECT id, action, clock FROM task_action WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let action: String = row.get("action");
                Ok(Some(TaskAction {
                    id: row.get("id"),
                    action: action.parse()?,
                    clock: row.get("clock"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn active_task_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id FROM task_action WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn update_task_action(&self, id: i64, action: ActionKind, clock: i64) -> Result<()> {
        let table = task_host_table(id);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE task_action SET action = $1, clock = $2 WHERE id = $3")
            .bind(action.as_str())
            .bind(clock)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(DispatchError::TaskNotFound(id));
        }

        let cancel_waiting = format!("UPDATE {table} SET status = $1 WHERE id = $2 AND status = $3");

        match action {
            ActionKind::Start => {
                sqlx::query("UPDATE task_scheduler SET scheduler = '' WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            ActionKind::Pause => {}
            ActionKind::Cancel => {
                sqlx::query(&cancel_waiting)
                    .bind(HostStatus::Cancelled.as_str())
                    .bind(id)
                    .bind(HostStatus::Waiting.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            ActionKind::Kill => {
                sqlx::query(&cancel_waiting)
                    .bind(HostStatus::Cancelled.as_str())
                    .bind(id)
                    .bind(HostStatus::Waiting.as_str())
                    .execute(&mut *tx)
                    .await?;

                sqlx::query(
                    "UPDATE task_host_doing SET action = $1, clock = $2 WHERE id = $3 AND action <> $1",
                )
                .bind(DoingAction::Kill.as_str())
                .bind(clock)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(&cancel_waiting)
                    .bind(HostStatus::Killing.as_str())
                    .bind(id)
                    .bind(HostStatus::Running.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_task(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            "DELETE FROM task_action WHERE id = $1",
            "DELETE FROM task_scheduler WHERE id = $1",
            "DELETE FROM task_host_doing WHERE id = $1",
        ] {
            sqlx::query(statement).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn long_task_ids(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id
            FROM task_action a
            JOIN task_meta m ON m.id = a.id
            WHERE m.created < $1
              AND a.action IN ('start', 'pause')
            ORDER BY a.id
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn task_hosts(&self, id: i64) -> Result<Vec<TaskHost>> {
        let rows = sqlx::query(&format!(
            "SELECT id, host, status, stdout, stderr FROM {} WHERE id = $1 ORDER BY ii",
            task_host_table(id)
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn task_host(&self, id: i64, host: &str) -> Result<Option<TaskHost>> {
        let row = sqlx::query(&format!(
            "SELECT id, host, status, stdout, stderr FROM {} WHERE id = $1 AND host = $2",
            task_host_table(id)
        ))
        .bind(id)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn waiting_host_count(&self, id: i64) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE id = $1 AND status = $2",
            task_host_table(id)
        ))
        .bind(id)
        .bind(HostStatus::Waiting.as_str())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn waiting_hosts(&self, id: i64, limit: u64) -> Result<Vec<TaskHost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, host, status, stdout, stderr FROM {}
            WHERE id = $1 AND status = $2
            ORDER BY ii
            LIMIT $3
            "#,
            task_host_table(id)
        ))
        .bind(id)
        .bind(HostStatus::Waiting.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn unexpected_host_count(&self, id: i64) -> Result<u64> {
        let unexpected: Vec<&str> = HostStatus::UNEXPECTED.iter().map(|s| s.as_str()).collect();
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE id = $1 AND status = ANY($2)",
            task_host_table(id)
        ))
        .bind(id)
        .bind(&unexpected[..])
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn run_waiting_hosts(&self, id: i64, hosts: &[String], clock: i64) -> Result<Vec<String>> {
        let table = task_host_table(id);
        let mut tx = self.pool.begin().await?;

        // Lock the action row so a concurrent completion cannot interleave.
        let active = sqlx::query("SELECT id FROM task_action WHERE id = $1 FOR SHARE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if active.is_none() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let flip = format!("UPDATE {table} SET status = $1 WHERE id = $2 AND host = $3 AND status = $4");
        let mut released = Vec::with_capacity(hosts.len());
        for host in hosts {
            let flipped = sqlx::query(&flip)
                .bind(HostStatus::Running.as_str())
                .bind(id)
                .bind(host)
                .bind(HostStatus::Waiting.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if flipped == 0 {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO task_host_doing (id, host, clock, action)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id, host) DO UPDATE SET clock = EXCLUDED.clock, action = EXCLUDED.action
                "#,
            )
            .bind(id)
            .bind(host)
            .bind(clock)
            .bind(DoingAction::Start.as_str())
            .execute(&mut *tx)
            .await?;

            released.push(host.clone());
        }

        tx.commit().await?;
        Ok(released)
    }

    async fn mark_timeout(&self, id: i64, host: &str, clock: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM task_host_doing WHERE id = $1 AND host = $2 AND clock = $3",
        )
        .bind(id)
        .bind(host)
        .bind(clock)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(&format!(
            "UPDATE {} SET status = $1 WHERE id = $2 AND host = $3",
            task_host_table(id)
        ))
        .bind(HostStatus::Timeout.as_str())
        .bind(id)
        .bind(host)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn redo_host(&self, id: i64, host: &str, action: DoingAction, clock: i64) -> Result<()> {
        let status = match action {
            DoingAction::Start => HostStatus::Running,
            DoingAction::Kill => HostStatus::Killing,
        };
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET status = $1 WHERE id = $2 AND host = $3",
            task_host_table(id)
        ))
        .bind(status.as_str())
        .bind(id)
        .bind(host)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(DispatchError::HostNotFound {
                id,
                host: host.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO task_host_doing (id, host, clock, action)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id, host) DO UPDATE SET clock = EXCLUDED.clock, action = EXCLUDED.action
            "#,
        )
        .bind(id)
        .bind(host)
        .bind(clock)
        .bind(action.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn ignore_host(&self, id: i64, host: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET status = $1 WHERE id = $2 AND host = $3",
            task_host_table(id)
        ))
        .bind(HostStatus::Ignored.as_str())
        .bind(id)
        .bind(host)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(DispatchError::HostNotFound {
                id,
                host: host.to_string(),
            });
        }

        sqlx::query("DELETE FROM task_host_doing WHERE id = $1 AND host = $2")
            .bind(id)
            .bind(host)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
