use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disttask_core::{
    models::{
        NewTask, NodeInfo, Step, Subtask, SubtaskOutcome, SubtaskSpec, SubtaskState, Task,
        TaskState, TaskTransition,
    },
    traits::TaskStore,
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, instrument};

const TASK_COLUMNS: &str = "id, task_key, task_type, state, step, concurrency, owner, owner_epoch, \
     meta, error, created_at, start_time, end_time, state_update_time";

const SUBTASK_COLUMNS: &str = "id, task_id, step, ordinal, exec_id, state, claim_token, retry_count, \
     meta, summary, row_count, error, create_time, start_time, update_time";

const NODE_COLUMNS: &str = "exec_id, epoch, can_be_owner, last_heartbeat_ms, registered_at";

/// 基于 SQLite 的任务存储，所有条件更新都是带 WHERE 条件的单条语句或事务
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let meta: String = row.try_get("meta")?;
        Ok(Task {
            id: row.try_get("id")?,
            key: row.try_get("task_key")?,
            task_type: row.try_get("task_type")?,
            state: row.try_get("state")?,
            step: Step(row.try_get("step")?),
            concurrency: row.try_get("concurrency")?,
            owner: row.try_get("owner")?,
            owner_epoch: row.try_get("owner_epoch")?,
            meta: serde_json::from_str(&meta)?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            state_update_time: row.try_get("state_update_time")?,
        })
    }

    fn row_to_subtask(row: &SqliteRow) -> SchedulerResult<Subtask> {
        let meta: String = row.try_get("meta")?;
        let summary: Option<String> = row.try_get("summary")?;
        Ok(Subtask {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            step: Step(row.try_get("step")?),
            ordinal: row.try_get("ordinal")?,
            exec_id: row.try_get("exec_id")?,
            state: row.try_get("state")?,
            claim_token: row.try_get("claim_token")?,
            retry_count: row.try_get("retry_count")?,
            meta: serde_json::from_str(&meta)?,
            summary: summary.as_deref().map(serde_json::from_str).transpose()?,
            row_count: row.try_get("row_count")?,
            error: row.try_get("error")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            update_time: row.try_get("update_time")?,
        })
    }

    fn row_to_node(row: &SqliteRow) -> SchedulerResult<NodeInfo> {
        let heartbeat_ms: i64 = row.try_get("last_heartbeat_ms")?;
        Ok(NodeInfo {
            exec_id: row.try_get("exec_id")?,
            epoch: row.try_get("epoch")?,
            can_be_owner: row.try_get("can_be_owner")?,
            last_heartbeat: DateTime::from_timestamp_millis(heartbeat_ms).ok_or_else(|| {
                SchedulerError::DatabaseOperation(format!("无效的心跳时间戳: {heartbeat_ms}"))
            })?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn rows_to_subtasks(rows: &[SqliteRow]) -> SchedulerResult<Vec<Subtask>> {
        rows.iter().map(Self::row_to_subtask).collect()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_key = %task.key, task_type = %task.task_type))]
    async fn create_task(&self, task: &NewTask) -> SchedulerResult<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO dist_tasks (task_key, task_type, state, step, concurrency, owner_epoch,
                                    meta, created_at, state_update_time)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(&task.key)
        .bind(&task.task_type)
        .bind(TaskState::Pending)
        .bind(Step::INIT.value())
        .bind(task.concurrency)
        .bind(serde_json::to_string(&task.meta)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.try_get("id")?),
            Err(e) if is_unique_violation(&e) => Err(SchedulerError::TaskAlreadyExists {
                key: task.key.clone(),
            }),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    async fn get_task_by_id(&self, id: i64) -> SchedulerResult<Task> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM dist_tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => Err(SchedulerError::TaskIdNotFound { id }),
        }
    }

    async fn get_task_by_key(&self, key: &str) -> SchedulerResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM dist_tasks WHERE task_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => Err(SchedulerError::TaskNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM dist_tasks ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_active_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM dist_tasks \
             WHERE state NOT IN ('SUCCEEDED', 'FAILED', 'REVERTED', 'CANCELLED') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn claim_task_owner(
        &self,
        task_id: i64,
        expected_owner: Option<&str>,
        expected_epoch: i64,
        new_owner: &str,
    ) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE dist_tasks SET owner = $1, owner_epoch = owner_epoch + 1
            WHERE id = $2 AND owner IS $3 AND owner_epoch = $4
              AND state NOT IN ('SUCCEEDED', 'FAILED', 'REVERTED', 'CANCELLED')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(new_owner)
        .bind(task_id)
        .bind(expected_owner)
        .bind(expected_epoch)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn release_task_owner(
        &self,
        task_id: i64,
        owner: &str,
        epoch: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE dist_tasks SET owner = NULL, owner_epoch = owner_epoch + 1 \
             WHERE id = $1 AND owner = $2 AND owner_epoch = $3",
        )
        .bind(task_id)
        .bind(owner)
        .bind(epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(from = %transition.expected_state, to = %transition.new_state))]
    async fn update_task_state(
        &self,
        task_id: i64,
        transition: &TaskTransition,
    ) -> SchedulerResult<bool> {
        if !transition.is_valid() {
            return Err(SchedulerError::InvalidStateTransition {
                from: transition.expected_state.to_string(),
                to: transition.new_state.to_string(),
            });
        }

        let now = Utc::now();
        let is_running = transition.new_state == TaskState::Running;
        let result = sqlx::query(
            r#"
            UPDATE dist_tasks
            SET state = $1,
                step = COALESCE($2, step),
                error = COALESCE($3, error),
                start_time = CASE WHEN $4 AND start_time IS NULL THEN $5 ELSE start_time END,
                end_time = CASE WHEN $6 THEN $5 ELSE end_time END,
                state_update_time = $5
            WHERE id = $7 AND state = $8 AND ($9 IS NULL OR owner_epoch = $9)
            "#,
        )
        .bind(transition.new_state)
        .bind(transition.step.map(Step::value))
        .bind(&transition.error)
        .bind(is_running)
        .bind(now)
        .bind(transition.new_state.is_terminal())
        .bind(task_id)
        .bind(transition.expected_state)
        .bind(transition.expected_epoch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // 区分竞争失败与任务不存在
        self.get_task_by_id(task_id).await?;
        Ok(false)
    }

    #[instrument(skip(self, specs), fields(count = specs.len()))]
    async fn create_subtasks(
        &self,
        task_id: i64,
        step: Step,
        expected_epoch: i64,
        specs: &[SubtaskSpec],
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;

        // 先写后读，直接拿到写锁，并确认 epoch 与步骤仍然匹配
        let guard = sqlx::query(
            "UPDATE dist_tasks SET state_update_time = state_update_time \
             WHERE id = $1 AND owner_epoch = $2 AND step = $3 AND state = 'RUNNING'",
        )
        .bind(task_id)
        .bind(expected_epoch)
        .bind(step.value())
        .execute(&mut *tx)
        .await?;
        if guard.rows_affected() != 1 {
            return Ok(false);
        }

        let existing: i64 = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM dist_subtasks WHERE task_id = $1 AND step = $2",
        )
        .bind(task_id)
        .bind(step.value())
        .fetch_one(&mut *tx)
        .await?
        .try_get("cnt")?;
        if existing > 0 {
            debug!("任务 {} 步骤 {} 已有 {} 个子任务，跳过创建", task_id, step, existing);
            return Ok(false);
        }

        let now = Utc::now();
        for (ordinal, spec) in specs.iter().enumerate() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO dist_subtasks (task_id, step, ordinal, state, meta, create_time, update_time)
                VALUES ($1, $2, $3, 'PENDING', $4, $5, $5)
                "#,
            )
            .bind(task_id)
            .bind(step.value())
            .bind(ordinal as i32)
            .bind(serde_json::to_string(&spec.meta)?)
            .bind(now)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(false),
                Err(e) => return Err(SchedulerError::Database(e)),
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_subtasks_by_step(
        &self,
        task_id: i64,
        step: Step,
    ) -> SchedulerResult<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM dist_subtasks WHERE task_id = $1 AND step = $2 ORDER BY ordinal"
        ))
        .bind(task_id)
        .bind(step.value())
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_subtasks(&rows)
    }

    async fn get_subtasks_by_task(&self, task_id: i64) -> SchedulerResult<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM dist_subtasks WHERE task_id = $1 ORDER BY step, ordinal"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_subtasks(&rows)
    }

    async fn get_subtasks_for_exec(&self, exec_id: &str) -> SchedulerResult<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM dist_subtasks WHERE exec_id = $1 AND state = 'RUNNING' ORDER BY id"
        ))
        .bind(exec_id)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_subtasks(&rows)
    }

    async fn get_running_subtasks(&self) -> SchedulerResult<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM dist_subtasks WHERE state = 'RUNNING' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_subtasks(&rows)
    }

    #[instrument(skip(self))]
    async fn claim_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
    ) -> SchedulerResult<Option<Subtask>> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE dist_subtasks
            SET state = 'RUNNING', exec_id = $1, claim_token = claim_token + 1,
                start_time = $2, update_time = $2
            WHERE id = $3 AND state = 'PENDING' AND exec_id IS NULL
            RETURNING {SUBTASK_COLUMNS}
            "#
        ))
        .bind(exec_id)
        .bind(now)
        .bind(subtask_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_subtask).transpose()
    }

    #[instrument(skip(self, outcome), fields(state = %outcome.state()))]
    async fn finish_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        outcome: &SubtaskOutcome,
    ) -> SchedulerResult<bool> {
        let (summary, row_count, error) = match outcome {
            SubtaskOutcome::Succeeded { summary, row_count } => (
                summary.as_ref().map(serde_json::to_string).transpose()?,
                Some(*row_count),
                None,
            ),
            SubtaskOutcome::Failed { error } => (None, None, Some(error.clone())),
            SubtaskOutcome::Cancelled => (None, None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE dist_subtasks
            SET state = $1, summary = COALESCE($2, summary), row_count = COALESCE($3, row_count),
                error = $4, update_time = $5
            WHERE id = $6 AND state = 'RUNNING' AND exec_id = $7 AND claim_token = $8
            "#,
        )
        .bind(outcome.state())
        .bind(summary)
        .bind(row_count)
        .bind(error)
        .bind(Utc::now())
        .bind(subtask_id)
        .bind(exec_id)
        .bind(claim_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_subtask_progress(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        row_count: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE dist_subtasks SET row_count = $1, update_time = $2 \
             WHERE id = $3 AND state = 'RUNNING' AND exec_id = $4 AND claim_token = $5",
        )
        .bind(row_count)
        .bind(Utc::now())
        .bind(subtask_id)
        .bind(exec_id)
        .bind(claim_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE dist_subtasks SET state = 'PENDING', exec_id = NULL, start_time = NULL, update_time = $1 \
             WHERE id = $2 AND state = 'RUNNING' AND exec_id = $3 AND claim_token = $4",
        )
        .bind(Utc::now())
        .bind(subtask_id)
        .bind(exec_id)
        .bind(claim_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reassign_subtask(
        &self,
        subtask_id: i64,
        expected_exec_id: &str,
        expected_claim_token: i64,
        max_retries: i32,
    ) -> SchedulerResult<Option<SubtaskState>> {
        let row = sqlx::query(
            r#"
            UPDATE dist_subtasks
            SET state = CASE WHEN retry_count >= $1 THEN 'FAILED' ELSE 'PENDING' END,
                error = CASE WHEN retry_count >= $1 THEN $2 ELSE error END,
                retry_count = CASE WHEN retry_count >= $1 THEN retry_count ELSE retry_count + 1 END,
                exec_id = NULL, start_time = NULL, update_time = $3
            WHERE id = $4 AND state = 'RUNNING' AND exec_id = $5 AND claim_token = $6
            RETURNING state
            "#,
        )
        .bind(max_retries)
        .bind(format!("执行节点 {expected_exec_id} 失效，重试次数已耗尽"))
        .bind(Utc::now())
        .bind(subtask_id)
        .bind(expected_exec_id)
        .bind(expected_claim_token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("state")?)),
            None => Ok(None),
        }
    }

    async fn update_subtask_state(
        &self,
        subtask_id: i64,
        expected: SubtaskState,
        new_state: SubtaskState,
    ) -> SchedulerResult<bool> {
        let sql = match (expected, new_state) {
            (SubtaskState::Failed, SubtaskState::Pending) => {
                "UPDATE dist_subtasks SET state = 'PENDING', exec_id = NULL, start_time = NULL, \
                 retry_count = retry_count + 1, update_time = $1 WHERE id = $2 AND state = 'FAILED'"
            }
            (SubtaskState::Pending, SubtaskState::Cancelled) => {
                "UPDATE dist_subtasks SET state = 'CANCELLED', update_time = $1 \
                 WHERE id = $2 AND state = 'PENDING'"
            }
            _ => {
                return Err(SchedulerError::InvalidStateTransition {
                    from: expected.to_string(),
                    to: new_state.to_string(),
                })
            }
        };

        let result = sqlx::query(sql)
            .bind(Utc::now())
            .bind(subtask_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, now))]
    async fn register_node(
        &self,
        exec_id: &str,
        can_be_owner: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<NodeInfo> {
        let mut tx = self.pool.begin().await?;

        let epoch: i64 = sqlx::query(
            "UPDATE dist_node_epochs SET last_epoch = last_epoch + 1 WHERE id = 1 RETURNING last_epoch",
        )
        .fetch_one(&mut *tx)
        .await?
        .try_get("last_epoch")?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO dist_nodes (exec_id, epoch, can_be_owner, last_heartbeat_ms, registered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (exec_id) DO UPDATE SET
                epoch = excluded.epoch,
                can_be_owner = excluded.can_be_owner,
                last_heartbeat_ms = excluded.last_heartbeat_ms,
                registered_at = excluded.registered_at
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(exec_id)
        .bind(epoch)
        .bind(can_be_owner)
        .bind(now.timestamp_millis())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let node = Self::row_to_node(&row)?;
        tx.commit().await?;
        Ok(node)
    }

    async fn heartbeat(
        &self,
        exec_id: &str,
        epoch: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE dist_nodes SET last_heartbeat_ms = MAX(last_heartbeat_ms, $1) \
             WHERE exec_id = $2 AND epoch = $3",
        )
        .bind(now.timestamp_millis())
        .bind(exec_id)
        .bind(epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn deregister_node(&self, exec_id: &str, epoch: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM dist_nodes WHERE exec_id = $1 AND epoch = $2")
            .bind(exec_id)
            .bind(epoch)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_nodes(&self) -> SchedulerResult<Vec<NodeInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM dist_nodes ORDER BY exec_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn remove_dead_node(
        &self,
        exec_id: &str,
        epoch: i64,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM dist_nodes WHERE exec_id = $1 AND epoch = $2 AND last_heartbeat_ms = $3",
        )
        .bind(exec_id)
        .bind(epoch)
        .bind(observed_heartbeat.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
