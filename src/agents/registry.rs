//! Agent registry: registration, approval, tokens and liveness.
//!
//! State machine per agent:
//!
//! ```text
//!   register ──► pending ──approve──► online ◄──heartbeat── offline
//!                   │                   │                      ▲
//!                reject              (stale for 2 min) ────────┘
//! ```
//!
//! Registration codes create agents directly in `online`.

use std::sync::Arc;

use chrono::Duration;

use crate::agents::locks::KeyedLocks;
use crate::agents::model::{
    Agent, AgentStatus, AgentUpdate, HeartbeatInfo, NewAgent, PendingStatus, RegisterRequest,
};
use crate::agents::token::{generate_token, tokens_match};
use crate::clock::Clock;
use crate::db::{AgentDeletion, AgentListFilter, Database};
use crate::error::{DispatchError, Result};

/// An online agent silent for longer than this is marked offline.
pub const LIVENESS_WINDOW: Duration = Duration::minutes(2);

/// Re-reads allowed when a status change lands between read and write.
const SAVE_ATTEMPTS: usize = 3;

pub struct AgentRegistry {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    agent_locks: KeyedLocks<i64>,
    name_locks: KeyedLocks<String>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            agent_locks: KeyedLocks::new(),
            name_locks: KeyedLocks::new(),
        }
    }

    /// Register an agent, or refresh the pending record of the same name.
    pub async fn register(&self, req: &RegisterRequest, ip: &str) -> Result<Agent> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(DispatchError::Validation("agent name is required".into()));
        }

        let _guard = self.name_locks.lock(&name.to_string()).await;

        if let Some(found) = self.store.find_pending_agent_by_name(name).await? {
            let _agent_guard = self.agent_locks.lock(&found.id).await;
            let now = self.clock.now();
            let refreshed = self
                .modify(found.id, |agent| {
                    if agent.status != AgentStatus::Pending {
                        return Err(not_pending(agent));
                    }
                    agent.hostname = req.hostname.clone();
                    agent.version = req.version.clone();
                    agent.ip = ip.to_string();
                    agent.last_seen = Some(now);
                    agent.updated_at = now;
                    Ok(())
                })
                .await;
            match refreshed {
                Ok(agent) => {
                    tracing::debug!(agent_id = agent.id, name = %name, "Pending agent re-registered");
                    return Ok(agent);
                }
                // Approved, redeemed or rejected since the lookup: nothing
                // pending to refresh any more.
                Err(DispatchError::InvalidState(_) | DispatchError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let now = self.clock.now();
        let agent = self
            .store
            .insert_agent(&NewAgent {
                name: name.to_string(),
                hostname: req.hostname.clone(),
                version: req.version.clone(),
                ip: ip.to_string(),
                status: AgentStatus::Pending,
                token: None,
                now,
            })
            .await?;

        tracing::info!(agent_id = agent.id, name = %name, ip = %ip, "New agent registered");
        Ok(agent)
    }

    /// Approve a pending agent and issue its token.
    ///
    /// The returned record is the only place the token is handed to an
    /// operator.
    pub async fn approve(&self, id: i64) -> Result<Agent> {
        let _guard = self.agent_locks.lock(&id).await;
        let now = self.clock.now();
        let agent = self
            .modify(id, |agent| {
                if agent.status != AgentStatus::Pending {
                    return Err(not_pending(agent));
                }
                agent.token = Some(generate_token());
                agent.status = AgentStatus::Online;
                agent.last_seen = Some(now);
                agent.updated_at = now;
                Ok(())
            })
            .await?;

        tracing::info!(agent_id = id, name = %agent.name, "Agent approved");
        Ok(agent)
    }

    /// Hard-delete an agent record regardless of its status.
    ///
    /// Unlike [`delete`](Self::delete) this does not check task references;
    /// tasks assigned to the agent become unassigned.
    pub async fn reject(&self, id: i64) -> Result<()> {
        let _guard = self.agent_locks.lock(&id).await;
        if !self.store.hard_delete_agent(id).await? {
            return Err(not_found(id));
        }
        tracing::info!(agent_id = id, "Agent rejected");
        Ok(())
    }

    /// Change operator-editable attributes. Disabling does not touch status.
    pub async fn update(&self, id: i64, update: &AgentUpdate) -> Result<Agent> {
        let name = update.name.trim();
        if name.is_empty() {
            return Err(DispatchError::Validation("agent name is required".into()));
        }

        let _guard = self.agent_locks.lock(&id).await;
        let now = self.clock.now();
        let agent = self
            .modify(id, |agent| {
                agent.name = name.to_string();
                agent.description = update.description.clone();
                agent.enabled = update.enabled;
                agent.updated_at = now;
                Ok(())
            })
            .await?;

        tracing::info!(agent_id = id, enabled = agent.enabled, "Agent updated");
        Ok(agent)
    }

    /// Soft-delete an agent that no task references.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let _guard = self.agent_locks.lock(&id).await;
        match self.store.soft_delete_agent(id, self.clock.now()).await? {
            AgentDeletion::Deleted => {
                tracing::info!(agent_id = id, "Agent deleted");
                Ok(())
            }
            AgentDeletion::NotFound => Err(not_found(id)),
            AgentDeletion::Referenced(count) => Err(DispatchError::Conflict(format!(
                "agent {} still has {} assigned task(s)",
                id, count
            ))),
        }
    }

    /// Resolve a bearer token to an enabled agent without changing anything.
    pub async fn authenticate(&self, token: &str) -> Result<Agent> {
        let agent = self
            .store
            .get_agent_by_token(token)
            .await?
            .ok_or(DispatchError::Unauthorized)?;
        if !agent.enabled {
            return Err(DispatchError::Forbidden);
        }
        Ok(agent)
    }

    /// Record a heartbeat: mark online, stamp last_seen and merge metadata.
    ///
    /// Empty metadata fields keep the stored values.
    pub async fn heartbeat(&self, token: &str, ip: &str, info: &HeartbeatInfo) -> Result<Agent> {
        let id = self.authenticate(token).await?.id;

        let _guard = self.agent_locks.lock(&id).await;
        // Taken inside the critical section so last_seen never moves
        // backwards for heartbeats handled by this process.
        let now = self.clock.now();
        // Re-read under the lock; the token may have been rotated or the
        // agent disabled in between.
        let agent = self
            .modify(id, |agent| {
                let still_valid = agent
                    .token
                    .as_deref()
                    .is_some_and(|stored| tokens_match(stored, token));
                if !still_valid {
                    return Err(DispatchError::Unauthorized);
                }
                if !agent.enabled {
                    return Err(DispatchError::Forbidden);
                }

                agent.status = AgentStatus::Online;
                agent.last_seen = Some(now);
                agent.ip = ip.to_string();
                merge_non_empty(&mut agent.version, &info.version);
                merge_non_empty(&mut agent.build_time, &info.build_time);
                merge_non_empty(&mut agent.hostname, &info.hostname);
                merge_non_empty(&mut agent.os, &info.os);
                merge_non_empty(&mut agent.arch, &info.arch);
                agent.updated_at = now;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                DispatchError::NotFound(_) => DispatchError::Unauthorized,
                other => other,
            })?;

        tracing::debug!(agent_id = id, version = %agent.version, "Heartbeat");
        Ok(agent)
    }

    /// Let an agent that has no token yet poll for its approval.
    pub async fn check_pending_status(&self, name: &str, ip: &str) -> Result<PendingStatus> {
        let found = self
            .store
            .find_agent_by_name_and_ip(name, ip)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Agent '{}' from {}", name, ip)))?;

        let _guard = self.agent_locks.lock(&found.id).await;
        let now = self.clock.now();
        let agent = self
            .modify(found.id, |agent| {
                agent.last_seen = Some(now);
                agent.updated_at = now;
                Ok(())
            })
            .await?;

        let token = match agent.status {
            AgentStatus::Pending => None,
            _ => agent.token.clone(),
        };
        Ok(PendingStatus {
            agent_id: agent.id,
            status: agent.status,
            token,
        })
    }

    /// Move every online agent silent for longer than [`LIVENESS_WINDOW`]
    /// to offline. Each agent is handled on its own; one failure does not
    /// stop the sweep.
    pub async fn mark_stale_offline(&self) -> Result<usize> {
        let cutoff = self.clock.now() - LIVENESS_WINDOW;
        let candidates = self.store.list_stale_online_agents(cutoff).await?;

        let mut marked = 0;
        for id in candidates {
            match self.store.mark_agent_offline_if_stale(id, cutoff).await {
                Ok(true) => {
                    marked += 1;
                    tracing::info!(agent_id = id, "Agent marked offline");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(agent_id = id, "Failed to mark agent offline: {}", e);
                }
            }
        }
        Ok(marked)
    }

    /// Issue a new token; the old one stops working immediately.
    pub async fn regenerate_token(&self, id: i64) -> Result<String> {
        let _guard = self.agent_locks.lock(&id).await;
        let now = self.clock.now();
        let token = generate_token();
        self.modify(id, |agent| {
            if agent.status == AgentStatus::Pending {
                return Err(DispatchError::InvalidState(format!(
                    "agent {} is pending; approve it first",
                    id
                )));
            }
            agent.token = Some(token.clone());
            agent.updated_at = now;
            Ok(())
        })
        .await?;

        tracing::info!(agent_id = id, "Agent token regenerated");
        Ok(token)
    }

    pub async fn set_force_update(&self, id: i64) -> Result<()> {
        self.set_force_flag(id, true).await
    }

    pub async fn clear_force_update(&self, id: i64) -> Result<()> {
        self.set_force_flag(id, false).await
    }

    pub async fn get(&self, id: i64) -> Result<Agent> {
        self.require(id).await
    }

    /// Approved agents, newest first.
    pub async fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents(AgentListFilter::Approved).await?)
    }

    /// Agents waiting for approval, newest first.
    pub async fn list_pending(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents(AgentListFilter::Pending).await?)
    }

    async fn set_force_flag(&self, id: i64, value: bool) -> Result<()> {
        let _guard = self.agent_locks.lock(&id).await;
        let now = self.clock.now();
        self.modify(id, |agent| {
            agent.force_update = value;
            agent.updated_at = now;
            Ok(())
        })
        .await?;
        tracing::info!(agent_id = id, force_update = value, "Force-update flag changed");
        Ok(())
    }

    async fn require(&self, id: i64) -> Result<Agent> {
        self.store.get_agent(id).await?.ok_or_else(|| not_found(id))
    }

    /// Re-read the agent, apply `change` and store the result, provided the
    /// status has not moved since the read. Code redemption and the liveness
    /// sweep change status without the agent lock; a save that loses to one
    /// of them is retried against the fresh record.
    async fn modify<F>(&self, id: i64, mut change: F) -> Result<Agent>
    where
        F: FnMut(&mut Agent) -> Result<()>,
    {
        for _ in 0..SAVE_ATTEMPTS {
            let mut agent = self.require(id).await?;
            let expected = agent.status;
            change(&mut agent)?;
            if self.store.save_agent(&agent, expected).await? {
                return Ok(agent);
            }
        }
        Err(DispatchError::Conflict(format!(
            "agent {} kept changing during update",
            id
        )))
    }
}

fn merge_non_empty(field: &mut String, incoming: &str) {
    if !incoming.is_empty() {
        *field = incoming.to_string();
    }
}

fn not_pending(agent: &Agent) -> DispatchError {
    DispatchError::InvalidState(format!("agent {} is {}, not pending", agent.id, agent.status))
}

fn not_found(id: i64) -> DispatchError {
    DispatchError::NotFound(format!("Agent {}", id))
}
