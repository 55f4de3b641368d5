//! PostgreSQL [`Database`] backend.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use crate::agents::{
    Agent, AgentStatus, CodeRejection, NewAgent, NewRegistrationCode, RegistrationCode,
};
use crate::config::DatabaseConfig;
use crate::db::{AgentDeletion, AgentListFilter, Database, Redemption};
use crate::error::DatabaseError;
use crate::ledger::{ExecutionRecord, ExecutionStatus};
use crate::stats::TaskStats;
use crate::tasks::Task;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const AGENT_COLUMNS: &str = "id, name, description, token, status, enabled, last_seen, ip, \
     version, build_time, hostname, os, arch, force_update, created_at, updated_at";

const CODE_COLUMNS: &str = "id, code, remark, max_uses, used_count, expires_at, created_at";

const TASK_COLUMNS: &str = "id, name, command, schedule, timeout, work_dir, envs, enabled, \
     agent_id, clean_config, last_run";

const EXECUTION_COLUMNS: &str = "id, task_id, agent_id, command, output, error, status, \
     duration_ms, exit_code, start_time, end_time, created_at";

/// Database store backed by a deadpool connection pool.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let report = embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Insert or replace a task definition. Used by operators seeding tasks
    /// and by the integration tests.
    pub async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, name, command, schedule, timeout, work_dir, envs, enabled,
                agent_id, clean_config, last_run
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                command = EXCLUDED.command,
                schedule = EXCLUDED.schedule,
                timeout = EXCLUDED.timeout,
                work_dir = EXCLUDED.work_dir,
                envs = EXCLUDED.envs,
                enabled = EXCLUDED.enabled,
                agent_id = EXCLUDED.agent_id,
                clean_config = EXCLUDED.clean_config,
                last_run = EXCLUDED.last_run
            "#,
            &[
                &task.id,
                &task.name,
                &task.command,
                &task.schedule,
                &task.timeout,
                &task.work_dir,
                &task.envs,
                &task.enabled,
                &task.agent_id,
                &task.clean_config,
                &task.last_run,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Database for PgStore {
    // ==================== Agents ====================

    async fn insert_agent(&self, agent: &NewAgent) -> Result<Agent, DatabaseError> {
        let conn = self.conn().await?;
        let status = agent.status.as_str();
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO agents (name, hostname, version, ip, status, token, last_seen, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7) RETURNING {}",
                    AGENT_COLUMNS
                ),
                &[
                    &agent.name,
                    &agent.hostname,
                    &agent.version,
                    &agent.ip,
                    &status,
                    &agent.token,
                    &agent.now,
                ],
            )
            .await
            .map_err(|e| unique_or_query(e, "agents.token"))?;
        row_to_agent(&row)
    }

    async fn get_agent(&self, id: i64) -> Result<Option<Agent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM agents WHERE id = $1 AND deleted_at IS NULL",
                    AGENT_COLUMNS
                ),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>, DatabaseError> {
        if token.is_empty() {
            return Ok(None);
        }
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM agents WHERE token = $1 AND deleted_at IS NULL",
                    AGENT_COLUMNS
                ),
                &[&token],
            )
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn find_pending_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM agents \
                     WHERE name = $1 AND status = 'pending' AND deleted_at IS NULL \
                     ORDER BY id DESC LIMIT 1",
                    AGENT_COLUMNS
                ),
                &[&name],
            )
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn find_agent_by_name_and_ip(
        &self,
        name: &str,
        ip: &str,
    ) -> Result<Option<Agent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM agents \
                     WHERE name = $1 AND ip = $2 AND deleted_at IS NULL \
                     ORDER BY id DESC LIMIT 1",
                    AGENT_COLUMNS
                ),
                &[&name, &ip],
            )
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn list_agents(&self, filter: AgentListFilter) -> Result<Vec<Agent>, DatabaseError> {
        let conn = self.conn().await?;
        let condition = match filter {
            AgentListFilter::Pending => "status = 'pending'",
            AgentListFilter::Approved => "status <> 'pending'",
        };
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM agents WHERE {} AND deleted_at IS NULL ORDER BY id DESC",
                    AGENT_COLUMNS, condition
                ),
                &[],
            )
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn save_agent(
        &self,
        agent: &Agent,
        expected: AgentStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let status = agent.status.as_str();
        let expected = expected.as_str();
        let updated = conn
            .execute(
                r#"
                UPDATE agents SET
                    name = $2, description = $3, token = $4, status = $5, enabled = $6,
                    last_seen = $7, ip = $8, version = $9, build_time = $10, hostname = $11,
                    os = $12, arch = $13, force_update = $14, updated_at = $15
                WHERE id = $1 AND deleted_at IS NULL AND status = $16
                "#,
                &[
                    &agent.id,
                    &agent.name,
                    &agent.description,
                    &agent.token,
                    &status,
                    &agent.enabled,
                    &agent.last_seen,
                    &agent.ip,
                    &agent.version,
                    &agent.build_time,
                    &agent.hostname,
                    &agent.os,
                    &agent.arch,
                    &agent.force_update,
                    &agent.updated_at,
                    &expected,
                ],
            )
            .await
            .map_err(|e| unique_or_query(e, "agents.token"))?;
        Ok(updated > 0)
    }

    async fn hard_delete_agent(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM agents WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn soft_delete_agent(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<AgentDeletion, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let exists = tx
            .query_opt(
                "SELECT id FROM agents WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
                &[&id],
            )
            .await?;
        if exists.is_none() {
            return Ok(AgentDeletion::NotFound);
        }

        let references: i64 = tx
            .query_one("SELECT COUNT(*) FROM tasks WHERE agent_id = $1", &[&id])
            .await?
            .get(0);
        if references > 0 {
            return Ok(AgentDeletion::Referenced(references));
        }

        tx.execute(
            "UPDATE agents SET deleted_at = $2, updated_at = $2 WHERE id = $1",
            &[&id, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(AgentDeletion::Deleted)
    }

    async fn list_stale_online_agents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM agents \
                 WHERE status = 'online' AND deleted_at IS NULL \
                 AND (last_seen IS NULL OR last_seen < $1) \
                 ORDER BY id",
                &[&cutoff],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn mark_agent_offline_if_stale(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agents SET status = 'offline' \
                 WHERE id = $1 AND status = 'online' AND deleted_at IS NULL \
                 AND (last_seen IS NULL OR last_seen < $2)",
                &[&id, &cutoff],
            )
            .await?;
        Ok(updated > 0)
    }

    // ==================== Registration codes ====================

    async fn insert_registration_code(
        &self,
        code: &NewRegistrationCode,
    ) -> Result<RegistrationCode, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO registration_codes (code, remark, max_uses, expires_at, created_at) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING {}",
                    CODE_COLUMNS
                ),
                &[
                    &code.code,
                    &code.remark,
                    &code.max_uses,
                    &code.expires_at,
                    &code.created_at,
                ],
            )
            .await
            .map_err(|e| unique_or_query(e, "registration_codes.code"))?;
        Ok(row_to_code(&row))
    }

    async fn list_registration_codes(&self) -> Result<Vec<RegistrationCode>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM registration_codes ORDER BY id DESC",
                    CODE_COLUMNS
                ),
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_code).collect())
    }

    async fn delete_registration_code(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM registration_codes WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    async fn redeem_registration_code(
        &self,
        code: &str,
        agent: &NewAgent,
    ) -> Result<Redemption, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let Some(row) = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM registration_codes WHERE code = $1 FOR UPDATE",
                    CODE_COLUMNS
                ),
                &[&code],
            )
            .await?
        else {
            return Ok(Redemption::NotFound);
        };
        let stored = row_to_code(&row);
        match stored.check_redeemable(agent.now) {
            Ok(()) => {}
            Err(CodeRejection::Expired) => return Ok(Redemption::Expired),
            Err(CodeRejection::Exhausted) => return Ok(Redemption::Exhausted),
        }

        let status = agent.status.as_str();
        let pending = tx
            .query_opt(
                "SELECT id FROM agents \
                 WHERE name = $1 AND status = 'pending' AND deleted_at IS NULL \
                 ORDER BY id DESC LIMIT 1 FOR UPDATE",
                &[&agent.name],
            )
            .await?;

        let row = match pending {
            Some(pending) => {
                let id: i64 = pending.get("id");
                tx.query_one(
                    &format!(
                        "UPDATE agents SET token = $2, status = $3, hostname = $4, version = $5, \
                         ip = $6, last_seen = $7, updated_at = $7 WHERE id = $1 RETURNING {}",
                        AGENT_COLUMNS
                    ),
                    &[
                        &id,
                        &agent.token,
                        &status,
                        &agent.hostname,
                        &agent.version,
                        &agent.ip,
                        &agent.now,
                    ],
                )
                .await
            }
            None => {
                tx.query_one(
                    &format!(
                        "INSERT INTO agents (name, hostname, version, ip, status, token, last_seen, created_at, updated_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7) RETURNING {}",
                        AGENT_COLUMNS
                    ),
                    &[
                        &agent.name,
                        &agent.hostname,
                        &agent.version,
                        &agent.ip,
                        &status,
                        &agent.token,
                        &agent.now,
                    ],
                )
                .await
            }
        }
        .map_err(|e| unique_or_query(e, "agents.token"))?;
        let redeemed = row_to_agent(&row)?;

        tx.execute(
            "UPDATE registration_codes SET used_count = used_count + 1 WHERE id = $1",
            &[&stored.id],
        )
        .await?;
        tx.commit().await?;

        Ok(Redemption::Redeemed(redeemed))
    }

    // ==================== Tasks ====================

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    async fn list_agent_tasks(&self, agent_id: i64) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM tasks WHERE agent_id = $1 AND enabled ORDER BY id",
                    TASK_COLUMNS
                ),
                &[&agent_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn touch_task_last_run(
        &self,
        task_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE tasks SET last_run = $2 WHERE id = $1",
            &[&task_id, &at],
        )
        .await?;
        Ok(())
    }

    // ==================== Execution records ====================

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let status = record.status.as_str();
        let row = conn
            .query_one(
                r#"
                INSERT INTO execution_records (
                    task_id, agent_id, command, output, error, status, duration_ms,
                    exit_code, start_time, end_time, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING id
                "#,
                &[
                    &record.task_id,
                    &record.agent_id,
                    &record.command,
                    &record.output,
                    &record.error,
                    &status,
                    &record.duration_ms,
                    &record.exit_code,
                    &record.start_time,
                    &record.end_time,
                    &record.created_at,
                ],
            )
            .await?;
        Ok(row.get("id"))
    }

    async fn update_running_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let status = record.status.as_str();
        let updated = conn
            .execute(
                r#"
                UPDATE execution_records SET
                    task_id = $2, agent_id = $3, command = $4, output = $5, error = $6,
                    status = $7, duration_ms = $8, exit_code = $9, start_time = $10,
                    end_time = $11
                WHERE id = $1 AND status = 'running'
                "#,
                &[
                    &record.id,
                    &record.task_id,
                    &record.agent_id,
                    &record.command,
                    &record.output,
                    &record.error,
                    &status,
                    &record.duration_ms,
                    &record.exit_code,
                    &record.start_time,
                    &record.end_time,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn update_execution_duration(
        &self,
        id: i64,
        duration_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE execution_records SET duration_ms = $2 WHERE id = $1 AND status = 'running'",
                &[&id, &duration_ms],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM execution_records WHERE id = $1",
                    EXECUTION_COLUMNS
                ),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_executions(&self, task_id: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM execution_records WHERE task_id = $1 ORDER BY id DESC",
                    EXECUTION_COLUMNS
                ),
                &[&task_id],
            )
            .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn delete_executions_created_before(
        &self,
        task_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        Ok(conn
            .execute(
                "DELETE FROM execution_records WHERE task_id = $1 AND created_at < $2",
                &[&task_id, &cutoff],
            )
            .await?)
    }

    async fn nth_latest_execution_id(
        &self,
        task_id: i64,
        offset: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        if offset < 0 {
            return Ok(None);
        }
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id FROM execution_records WHERE task_id = $1 \
                 ORDER BY id DESC OFFSET $2 LIMIT 1",
                &[&task_id, &offset],
            )
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn delete_executions_below_id(
        &self,
        task_id: i64,
        id: i64,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        Ok(conn
            .execute(
                "DELETE FROM execution_records WHERE task_id = $1 AND id < $2",
                &[&task_id, &id],
            )
            .await?)
    }

    // ==================== Stats ====================

    async fn increment_task_stats(
        &self,
        task_id: i64,
        day: NaiveDate,
        status: ExecutionStatus,
    ) -> Result<(), DatabaseError> {
        let (success, fail): (i64, i64) = match status {
            ExecutionStatus::Success => (1, 0),
            ExecutionStatus::Failed => (0, 1),
            ExecutionStatus::Running => return Ok(()),
        };
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO task_stats (task_id, day, success_count, fail_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_id, day) DO UPDATE SET
                success_count = task_stats.success_count + EXCLUDED.success_count,
                fail_count = task_stats.fail_count + EXCLUDED.fail_count
            "#,
            &[&task_id, &day, &success, &fail],
        )
        .await?;
        Ok(())
    }

    async fn list_task_stats(&self, task_id: i64) -> Result<Vec<TaskStats>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT task_id, day, success_count, fail_count FROM task_stats \
                 WHERE task_id = $1 ORDER BY day",
                &[&task_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| TaskStats {
                task_id: r.get("task_id"),
                day: r.get("day"),
                success_count: r.get("success_count"),
                fail_count: r.get("fail_count"),
            })
            .collect())
    }
}

fn unique_or_query(e: tokio_postgres::Error, constraint: &str) -> DatabaseError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        DatabaseError::UniqueViolation(constraint.to_string())
    } else {
        DatabaseError::Query(e)
    }
}

fn parse_column<T>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse::<T>().map_err(DatabaseError::Serialization)
}

fn row_to_agent(row: &Row) -> Result<Agent, DatabaseError> {
    Ok(Agent {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        token: row.get("token"),
        status: parse_column::<AgentStatus>(row, "status")?,
        enabled: row.get("enabled"),
        last_seen: row.get("last_seen"),
        ip: row.get("ip"),
        version: row.get("version"),
        build_time: row.get("build_time"),
        hostname: row.get("hostname"),
        os: row.get("os"),
        arch: row.get("arch"),
        force_update: row.get("force_update"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_code(row: &Row) -> RegistrationCode {
    RegistrationCode {
        id: row.get("id"),
        code: row.get("code"),
        remark: row.get("remark"),
        max_uses: row.get("max_uses"),
        used_count: row.get("used_count"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

fn row_to_task(row: &Row) -> Task {
    Task {
        id: row.get("id"),
        name: row.get("name"),
        command: row.get("command"),
        schedule: row.get("schedule"),
        timeout: row.get("timeout"),
        work_dir: row.get("work_dir"),
        envs: row.get("envs"),
        enabled: row.get("enabled"),
        agent_id: row.get("agent_id"),
        clean_config: row.get("clean_config"),
        last_run: row.get("last_run"),
    }
}

fn row_to_execution(row: &Row) -> Result<ExecutionRecord, DatabaseError> {
    Ok(ExecutionRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        command: row.get("command"),
        output: row.get("output"),
        error: row.get("error"),
        status: parse_column::<ExecutionStatus>(row, "status")?,
        duration_ms: row.get("duration_ms"),
        exit_code: row.get("exit_code"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        created_at: row.get("created_at"),
    })
}
