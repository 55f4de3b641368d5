//! In-memory [`Database`] backend.
//!
//! All state sits behind one `RwLock`, so every trait method is atomic with
//! respect to every other. Used by the test suite and by `serve` when no
//! `DATABASE_URL` is configured.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::agents::{
    Agent, AgentStatus, CodeRejection, NewAgent, NewRegistrationCode, RegistrationCode,
};
use crate::db::{AgentDeletion, AgentListFilter, Database, Redemption};
use crate::error::DatabaseError;
use crate::ledger::{ExecutionRecord, ExecutionStatus};
use crate::stats::TaskStats;
use crate::tasks::Task;

struct StoredAgent {
    agent: Agent,
    deleted_at: Option<DateTime<Utc>>,
}

impl StoredAgent {
    fn live(&self) -> Option<&Agent> {
        match self.deleted_at {
            None => Some(&self.agent),
            Some(_) => None,
        }
    }
}

#[derive(Default)]
struct State {
    agents: BTreeMap<i64, StoredAgent>,
    codes: BTreeMap<i64, RegistrationCode>,
    tasks: BTreeMap<i64, Task>,
    executions: BTreeMap<i64, ExecutionRecord>,
    stats: BTreeMap<(i64, NaiveDate), TaskStats>,
    next_agent_id: i64,
    next_code_id: i64,
    next_execution_id: i64,
}

impl State {
    fn live_agents(&self) -> impl DoubleEndedIterator<Item = &Agent> {
        self.agents.values().filter_map(StoredAgent::live)
    }

    fn insert_agent(&mut self, new: &NewAgent) -> Result<Agent, DatabaseError> {
        if let Some(token) = new.token.as_deref()
            && self.agents.values().any(|s| s.agent.token.as_deref() == Some(token))
        {
            return Err(DatabaseError::UniqueViolation("agents.token".into()));
        }

        self.next_agent_id += 1;
        let agent = Agent {
            id: self.next_agent_id,
            name: new.name.clone(),
            description: String::new(),
            token: new.token.clone(),
            status: new.status,
            enabled: true,
            last_seen: Some(new.now),
            ip: new.ip.clone(),
            version: new.version.clone(),
            build_time: String::new(),
            hostname: new.hostname.clone(),
            os: String::new(),
            arch: String::new(),
            force_update: false,
            created_at: new.now,
            updated_at: new.now,
        };
        self.agents.insert(
            agent.id,
            StoredAgent {
                agent: agent.clone(),
                deleted_at: None,
            },
        );
        Ok(agent)
    }

    fn live_agent_mut(&mut self, id: i64) -> Option<&mut Agent> {
        self.agents
            .get_mut(&id)
            .filter(|s| s.deleted_at.is_none())
            .map(|s| &mut s.agent)
    }
}

/// Process-local store with the same semantics as the PostgreSQL backend.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task definition. Tasks are owned by the
    /// dashboard, so there is no trait method for this.
    pub async fn put_task(&self, task: Task) {
        self.state.write().await.tasks.insert(task.id, task);
    }

    pub async fn remove_task(&self, id: i64) -> Option<Task> {
        self.state.write().await.tasks.remove(&id)
    }

    /// Number of agent rows, soft-deleted ones included.
    pub async fn agent_count(&self) -> usize {
        self.state.read().await.agents.len()
    }
}

#[async_trait]
impl Database for InMemoryStore {
    // --- Agents ---

    async fn insert_agent(&self, agent: &NewAgent) -> Result<Agent, DatabaseError> {
        self.state.write().await.insert_agent(agent)
    }

    async fn get_agent(&self, id: i64) -> Result<Option<Agent>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.agents.get(&id).and_then(StoredAgent::live).cloned())
    }

    async fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>, DatabaseError> {
        if token.is_empty() {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(state
            .live_agents()
            .find(|a| a.token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_pending_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .live_agents()
            .rev()
            .find(|a| a.status == AgentStatus::Pending && a.name == name)
            .cloned())
    }

    async fn find_agent_by_name_and_ip(
        &self,
        name: &str,
        ip: &str,
    ) -> Result<Option<Agent>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .live_agents()
            .rev()
            .find(|a| a.name == name && a.ip == ip)
            .cloned())
    }

    async fn list_agents(&self, filter: AgentListFilter) -> Result<Vec<Agent>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .live_agents()
            .rev()
            .filter(|a| match filter {
                AgentListFilter::Pending => a.status == AgentStatus::Pending,
                AgentListFilter::Approved => a.status != AgentStatus::Pending,
            })
            .cloned()
            .collect())
    }

    async fn save_agent(
        &self,
        agent: &Agent,
        expected: AgentStatus,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        if let Some(token) = agent.token.as_deref()
            && state
                .agents
                .values()
                .any(|s| s.agent.id != agent.id && s.agent.token.as_deref() == Some(token))
        {
            return Err(DatabaseError::UniqueViolation("agents.token".into()));
        }
        match state.live_agent_mut(agent.id) {
            Some(stored) if stored.status == expected => {
                let created_at = stored.created_at;
                *stored = agent.clone();
                stored.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hard_delete_agent(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        if state.live_agent_mut(id).is_none() {
            return Ok(false);
        }
        for task in state.tasks.values_mut() {
            if task.agent_id == Some(id) {
                task.agent_id = None;
            }
        }
        Ok(state.agents.remove(&id).is_some())
    }

    async fn soft_delete_agent(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<AgentDeletion, DatabaseError> {
        let mut state = self.state.write().await;
        if state.live_agent_mut(id).is_none() {
            return Ok(AgentDeletion::NotFound);
        }

        let references = state
            .tasks
            .values()
            .filter(|t| t.agent_id == Some(id))
            .count() as i64;
        if references > 0 {
            return Ok(AgentDeletion::Referenced(references));
        }

        if let Some(stored) = state.agents.get_mut(&id) {
            stored.deleted_at = Some(now);
            stored.agent.updated_at = now;
        }
        Ok(AgentDeletion::Deleted)
    }

    async fn list_stale_online_agents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .live_agents()
            .filter(|a| is_stale_online(a, cutoff))
            .map(|a| a.id)
            .collect())
    }

    async fn mark_agent_offline_if_stale(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        match state.live_agent_mut(id) {
            Some(agent) if is_stale_online(agent, cutoff) => {
                agent.status = AgentStatus::Offline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // --- Registration codes ---

    async fn insert_registration_code(
        &self,
        code: &NewRegistrationCode,
    ) -> Result<RegistrationCode, DatabaseError> {
        let mut state = self.state.write().await;
        if state.codes.values().any(|c| c.code == code.code) {
            return Err(DatabaseError::UniqueViolation(
                "registration_codes.code".into(),
            ));
        }

        state.next_code_id += 1;
        let stored = RegistrationCode {
            id: state.next_code_id,
            code: code.code.clone(),
            remark: code.remark.clone(),
            max_uses: code.max_uses,
            used_count: 0,
            expires_at: code.expires_at,
            created_at: code.created_at,
        };
        state.codes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_registration_codes(&self) -> Result<Vec<RegistrationCode>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.codes.values().rev().cloned().collect())
    }

    async fn delete_registration_code(&self, id: i64) -> Result<bool, DatabaseError> {
        Ok(self.state.write().await.codes.remove(&id).is_some())
    }

    async fn redeem_registration_code(
        &self,
        code: &str,
        agent: &NewAgent,
    ) -> Result<Redemption, DatabaseError> {
        let mut state = self.state.write().await;

        let Some(code_id) = state
            .codes
            .values()
            .find(|c| c.code == code)
            .map(|c| c.id)
        else {
            return Ok(Redemption::NotFound);
        };

        if let Some(stored) = state.codes.get(&code_id) {
            match stored.check_redeemable(agent.now) {
                Ok(()) => {}
                Err(CodeRejection::Expired) => return Ok(Redemption::Expired),
                Err(CodeRejection::Exhausted) => return Ok(Redemption::Exhausted),
            }
        }

        let pending_id = state
            .live_agents()
            .rev()
            .find(|a| a.status == AgentStatus::Pending && a.name == agent.name)
            .map(|a| a.id);

        let redeemed = match pending_id.and_then(|id| state.live_agent_mut(id)) {
            Some(existing) => {
                existing.token = agent.token.clone();
                existing.status = agent.status;
                existing.hostname = agent.hostname.clone();
                existing.version = agent.version.clone();
                existing.ip = agent.ip.clone();
                existing.last_seen = Some(agent.now);
                existing.updated_at = agent.now;
                existing.clone()
            }
            None => state.insert_agent(agent)?,
        };

        if let Some(stored) = state.codes.get_mut(&code_id) {
            stored.used_count += 1;
        }
        Ok(Redemption::Redeemed(redeemed))
    }

    // --- Tasks ---

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn list_agent_tasks(&self, agent_id: i64) -> Result<Vec<Task>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.enabled && t.agent_id == Some(agent_id))
            .cloned()
            .collect())
    }

    async fn touch_task_last_run(
        &self,
        task_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if let Some(task) = self.state.write().await.tasks.get_mut(&task_id) {
            task.last_run = Some(at);
        }
        Ok(())
    }

    // --- Execution records ---

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<i64, DatabaseError> {
        let mut state = self.state.write().await;
        state.next_execution_id += 1;
        let id = state.next_execution_id;
        let mut stored = record.clone();
        stored.id = id;
        state.executions.insert(id, stored);
        Ok(id)
    }

    async fn update_running_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&record.id) {
            Some(stored) if stored.status == ExecutionStatus::Running => {
                let created_at = stored.created_at;
                *stored = record.clone();
                stored.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_execution_duration(
        &self,
        id: i64,
        duration_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&id) {
            Some(stored) if stored.status == ExecutionStatus::Running => {
                stored.duration_ms = duration_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, DatabaseError> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, task_id: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .rev()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_executions_created_before(
        &self,
        task_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state.write().await;
        let before = state.executions.len();
        state
            .executions
            .retain(|_, r| !(r.task_id == task_id && r.created_at < cutoff));
        Ok((before - state.executions.len()) as u64)
    }

    async fn nth_latest_execution_id(
        &self,
        task_id: i64,
        offset: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        if offset < 0 {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .rev()
            .filter(|r| r.task_id == task_id)
            .nth(offset as usize)
            .map(|r| r.id))
    }

    async fn delete_executions_below_id(
        &self,
        task_id: i64,
        id: i64,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state.write().await;
        let before = state.executions.len();
        state
            .executions
            .retain(|_, r| !(r.task_id == task_id && r.id < id));
        Ok((before - state.executions.len()) as u64)
    }

    // --- Stats ---

    async fn increment_task_stats(
        &self,
        task_id: i64,
        day: NaiveDate,
        status: ExecutionStatus,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        let entry = state
            .stats
            .entry((task_id, day))
            .or_insert_with(|| TaskStats {
                task_id,
                day,
                success_count: 0,
                fail_count: 0,
            });
        match status {
            ExecutionStatus::Success => entry.success_count += 1,
            ExecutionStatus::Failed => entry.fail_count += 1,
            ExecutionStatus::Running => {}
        }
        Ok(())
    }

    async fn list_task_stats(&self, task_id: i64) -> Result<Vec<TaskStats>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .stats
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }
}

fn is_stale_online(agent: &Agent, cutoff: DateTime<Utc>) -> bool {
    agent.status == AgentStatus::Online && agent.last_seen.is_none_or(|seen| seen < cutoff)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn new_agent(name: &str, status: AgentStatus, token: Option<&str>) -> NewAgent {
        NewAgent {
            name: name.into(),
            hostname: "h".into(),
            version: "1.0".into(),
            ip: "10.0.0.1".into(),
            status,
            token: token.map(String::from),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_assigned_in_order() {
        let store = InMemoryStore::new();
        let a = store
            .insert_agent(&new_agent("a", AgentStatus::Pending, None))
            .await
            .unwrap();
        let b = store
            .insert_agent(&new_agent("b", AgentStatus::Pending, None))
            .await
            .unwrap();
        assert!(b.id > a.id);

        let listed = store.list_agents(AgentListFilter::Pending).await.unwrap();
        assert_eq!(listed[0].id, b.id);
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let store = InMemoryStore::new();
        store
            .insert_agent(&new_agent("a", AgentStatus::Online, Some("t1")))
            .await
            .unwrap();
        let err = store
            .insert_agent(&new_agent("b", AgentStatus::Online, Some("t1")))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_soft_deleted_agents_are_invisible() {
        let store = InMemoryStore::new();
        let agent = store
            .insert_agent(&new_agent("a", AgentStatus::Online, Some("t1")))
            .await
            .unwrap();

        assert_eq!(
            store.soft_delete_agent(agent.id, Utc::now()).await.unwrap(),
            AgentDeletion::Deleted
        );
        assert!(store.get_agent(agent.id).await.unwrap().is_none());
        assert!(store.get_agent_by_token("t1").await.unwrap().is_none());
        assert!(!store.save_agent(&agent, AgentStatus::Online).await.unwrap());
        assert!(!store.hard_delete_agent(agent.id).await.unwrap());
        assert_eq!(store.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_conditional_offline_respects_fresh_heartbeat() {
        let store = InMemoryStore::new();
        let agent = store
            .insert_agent(&new_agent("a", AgentStatus::Online, Some("t1")))
            .await
            .unwrap();
        let cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(
            store.list_stale_online_agents(cutoff).await.unwrap(),
            vec![agent.id]
        );

        // A heartbeat lands between listing and marking.
        let mut fresh = agent.clone();
        fresh.last_seen = Some(cutoff + Duration::seconds(1));
        assert!(store.save_agent(&fresh, AgentStatus::Online).await.unwrap());

        assert!(!store.mark_agent_offline_if_stale(agent.id, cutoff).await.unwrap());
        assert_eq!(
            store.get_agent(agent.id).await.unwrap().unwrap().status,
            AgentStatus::Online
        );
    }

    #[tokio::test]
    async fn test_save_agent_refuses_stale_status() {
        let store = InMemoryStore::new();
        let pending = store
            .insert_agent(&new_agent("a", AgentStatus::Pending, None))
            .await
            .unwrap();

        let mut approved = pending.clone();
        approved.status = AgentStatus::Online;
        approved.token = Some("t1".into());
        assert!(store.save_agent(&approved, AgentStatus::Pending).await.unwrap());

        // A writer that still believes the agent is pending loses.
        let mut refreshed = pending.clone();
        refreshed.hostname = "other".into();
        assert!(!store.save_agent(&refreshed, AgentStatus::Pending).await.unwrap());

        let stored = store.get_agent(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Online);
        assert_eq!(stored.token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_terminal_execution_is_not_overwritten() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut record = ExecutionRecord {
            id: 0,
            task_id: 1,
            agent_id: None,
            command: "true".into(),
            output: String::new(),
            error: None,
            status: ExecutionStatus::Success,
            duration_ms: 10,
            exit_code: Some(0),
            start_time: Some(now),
            end_time: Some(now),
            created_at: now,
        };
        record.id = store.insert_execution(&record).await.unwrap();

        record.status = ExecutionStatus::Failed;
        assert!(!store.update_running_execution(&record).await.unwrap());
        assert_eq!(
            store.get_execution(record.id).await.unwrap().unwrap().status,
            ExecutionStatus::Success
        );
    }
}
