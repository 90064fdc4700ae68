use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::runtime::storage::StateStore;
use crate::runtime::task::{StepPatch, StepRecord, TaskPatch, TaskRecord, TaskStatus};

const TASK_PREFIX: &str = "archflow:task:";
const STEP_PREFIX: &str = "archflow:step:";

// KEYS[1] = row hash, KEYS[2] = index the row id is added to
// ARGV[1] = "zadd", "rpush" or "" for no index, ARGV[2] = score, ARGV[3] = id
// ARGV[4..] = field/value pairs
const INSERT_SCRIPT: &str = r#"
    local key = KEYS[1]
    if redis.call("EXISTS", key) == 1 then
        return 0
    end
    for i = 4, #ARGV, 2 do
        redis.call("HSET", key, ARGV[i], ARGV[i + 1])
    end
    if ARGV[1] == "zadd" then
        redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
    elseif ARGV[1] == "rpush" then
        redis.call("RPUSH", KEYS[2], ARGV[3])
    end
    return 1
"#;

// KEYS[1] = row hash
// ARGV[1] = expected JSON-encoded status, or "" to skip the check
// ARGV[2..] = field/value pairs
const PATCH_SCRIPT: &str = r#"
    local key = KEYS[1]
    if redis.call("EXISTS", key) == 0 then
        return -1
    end
    local expected = ARGV[1]
    if expected ~= "" and redis.call("HGET", key, "status") ~= expected then
        return 0
    end
    for i = 2, #ARGV, 2 do
        redis.call("HSET", key, ARGV[i], ARGV[i + 1])
    end
    return 1
"#;

// KEYS[1] = zset of a step's task ids scored by position
// ARGV[1] = lower score bound, ARGV[2] = PENDING, ARGV[3] = attempt,
// ARGV[4] = task key prefix, ARGV[5] = FAILURE, ARGV[6] = completed_at
const FAIL_AFTER_SCRIPT: &str = r#"
    local ids = redis.call("ZRANGEBYSCORE", KEYS[1], ARGV[1], "+inf")
    local changed = 0
    for _, id in ipairs(ids) do
        local key = ARGV[4] .. id
        if redis.call("HGET", key, "status") == ARGV[2] and redis.call("HGET", key, "attempt") == ARGV[3] then
            redis.call("HSET", key, "status", ARGV[5], "traceback", "null", "completed_at", ARGV[6])
            changed = changed + 1
        end
    end
    return changed
"#;

/// Redis-backed [`StateStore`]. Each row is a hash whose fields hold the
/// JSON encoding of the corresponding record field.
pub struct RedisStateStore {
    client: redis::Client,
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }

    fn task_key(&self, id: Uuid) -> String {
        format!("{}{}", TASK_PREFIX, id)
    }

    fn step_key(&self, id: Uuid) -> String {
        format!("{}{}", STEP_PREFIX, id)
    }

    fn step_tasks_key(&self, step_id: Uuid) -> String {
        format!("{}{}:tasks", STEP_PREFIX, step_id)
    }

    fn child_steps_key(&self, step_id: Uuid) -> String {
        format!("{}{}:steps", STEP_PREFIX, step_id)
    }

    fn package_key(&self, package: &str) -> String {
        format!("archflow:package:{}:steps", package)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load_rows<T: DeserializeOwned>(&self, ids: &[String], prefix: &str) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(format!("{}{}", prefix, id));
        }
        let raw: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        raw.into_iter()
            .filter(|fields| !fields.is_empty())
            .map(from_fields)
            .collect()
    }

    /// Writes a new row and indexes it. Returns false if the row existed.
    async fn run_insert(
        &self,
        key: String,
        index: Option<(&str, String, u32)>,
        id: Uuid,
        fields: Vec<(String, String)>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(INSERT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        match index {
            Some((command, index_key, score)) => {
                invocation.key(&key).key(index_key).arg(command).arg(score);
            }
            None => {
                invocation.key(&key).key(&key).arg("").arg(0);
            }
        }
        invocation.arg(id.to_string());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(inserted == 1)
    }

    async fn run_patch(&self, key: String, expected: &str, fields: Vec<(String, String)>) -> Result<i64> {
        if fields.is_empty() {
            return Ok(1);
        }
        let mut conn = self.conn().await?;
        let script = redis::Script::new(PATCH_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(key).arg(expected);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

/// Flattens a record or patch into `(field, json)` pairs.
fn to_fields<T: Serialize>(value: &T) -> Result<Vec<(String, String)>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, v.to_string())).collect()),
        other => Err(EngineError::Persistence(format!(
            "expected an object to store, got {}",
            other
        ))),
    }
}

fn from_fields<T: DeserializeOwned>(fields: HashMap<String, String>) -> Result<T> {
    let mut map = Map::new();
    for (k, v) in fields {
        map.insert(k, serde_json::from_str(&v)?);
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn insert_step(&self, step: StepRecord) -> Result<()> {
        let fields = to_fields(&step)?;
        let index = match (&step.parent_step, &step.information_package) {
            (Some(parent), _) => Some(("zadd", self.child_steps_key(*parent), step.position)),
            (None, Some(package)) => Some(("rpush", self.package_key(package), 0)),
            (None, None) => None,
        };
        if !self.run_insert(self.step_key(step.id), index, step.id, fields).await? {
            return Err(EngineError::RowExists { kind: "step", id: step.id });
        }
        Ok(())
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<()> {
        let fields = to_fields(&task)?;
        let index = Some(("zadd", self.step_tasks_key(task.step_id), task.position));
        if !self.run_insert(self.task_key(task.id), index, task.id, fields).await? {
            return Err(EngineError::RowExists { kind: "task", id: task.id });
        }
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRecord>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.step_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(fields).map(Some)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.task_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(fields).map(Some)
    }

    async fn step_tasks(&self, step_id: Uuid) -> Result<Vec<TaskRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(self.step_tasks_key(step_id), 0, -1).await?;
        self.load_rows(&ids, TASK_PREFIX).await
    }

    async fn child_steps(&self, step_id: Uuid) -> Result<Vec<StepRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(self.child_steps_key(step_id), 0, -1).await?;
        self.load_rows(&ids, STEP_PREFIX).await
    }

    async fn package_steps(&self, package: &str) -> Result<Vec<StepRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.lrange(self.package_key(package), 0, -1).await?;
        self.load_rows(&ids, STEP_PREFIX).await
    }

    async fn patch_task(&self, id: Uuid, patch: TaskPatch) -> Result<()> {
        let expected = match patch.expect_status {
            Some(status) => serde_json::to_string(&status)?,
            None => String::new(),
        };
        let fields = to_fields(&patch)?;
        match self.run_patch(self.task_key(id), &expected, fields).await? {
            -1 => Err(EngineError::TaskNotFound(id)),
            0 => Err(EngineError::AlreadyStarted(id)),
            _ => Ok(()),
        }
    }

    async fn patch_step(&self, id: Uuid, patch: StepPatch) -> Result<()> {
        let fields = to_fields(&patch)?;
        match self.run_patch(self.step_key(id), "", fields).await? {
            -1 => Err(EngineError::StepNotFound(id)),
            _ => Ok(()),
        }
    }

    async fn fail_pending_after(
        &self,
        step_id: Uuid,
        attempt: u32,
        after: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let lower = match after {
            Some(position) => format!("({}", position),
            None => "-inf".to_string(),
        };
        let mut conn = self.conn().await?;
        let changed: usize = redis::Script::new(FAIL_AFTER_SCRIPT)
            .key(self.step_tasks_key(step_id))
            .arg(lower)
            .arg(serde_json::to_string(&TaskStatus::Pending)?)
            .arg(attempt.to_string())
            .arg(TASK_PREFIX)
            .arg(serde_json::to_string(&TaskStatus::Failure)?)
            .arg(serde_json::to_string(&at)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed)
    }
}
