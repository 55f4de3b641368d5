//! Registration codes: operator-issued credentials that let an agent skip
//! the pending/approve round trip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::locks::KeyedLocks;
use crate::agents::model::{Agent, AgentStatus, NewAgent, RegisterRequest};
use crate::agents::token::{generate_code, generate_token};
use crate::clock::Clock;
use crate::db::{Database, Redemption};
use crate::error::{DatabaseError, DispatchError, Result};

/// Attempts at drawing a fresh code value before giving up.
const CODE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationCode {
    pub id: i64,
    pub code: String,
    pub remark: String,
    /// 0 = unlimited.
    pub max_uses: i32,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Why a code cannot be redeemed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRejection {
    Expired,
    Exhausted,
}

impl RegistrationCode {
    /// Apply the redeemability rule at `now`.
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> std::result::Result<(), CodeRejection> {
        if self.expires_at.is_some_and(|at| at <= now) {
            return Err(CodeRejection::Expired);
        }
        if self.max_uses > 0 && self.used_count >= self.max_uses {
            return Err(CodeRejection::Exhausted);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewRegistrationCode {
    pub code: String,
    pub remark: String,
    pub max_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Operator request to mint a code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCodeRequest {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub max_uses: i32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct RegistrationCodeIssuer {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    code_locks: KeyedLocks<String>,
}

impl RegistrationCodeIssuer {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            code_locks: KeyedLocks::new(),
        }
    }

    /// Mint a new code.
    pub async fn create_code(&self, req: CreateCodeRequest) -> Result<RegistrationCode> {
        if req.max_uses < 0 {
            return Err(DispatchError::Validation(
                "max_uses must be zero (unlimited) or positive".into(),
            ));
        }
        let now = self.clock.now();
        if req.expires_at.is_some_and(|at| at <= now) {
            return Err(DispatchError::Validation(
                "expires_at must be in the future".into(),
            ));
        }

        let mut last_err = None;
        for _ in 0..CODE_ATTEMPTS {
            let new_code = NewRegistrationCode {
                code: generate_code(),
                remark: req.remark.clone(),
                max_uses: req.max_uses,
                expires_at: req.expires_at,
                created_at: now,
            };
            match self.store.insert_registration_code(&new_code).await {
                Ok(code) => {
                    tracing::info!(
                        code_id = code.id,
                        max_uses = code.max_uses,
                        expires_at = ?code.expires_at,
                        "Registration code created"
                    );
                    return Ok(code);
                }
                Err(DatabaseError::UniqueViolation(e)) => {
                    tracing::warn!("Registration code collision, retrying: {}", e);
                    last_err = Some(DatabaseError::UniqueViolation(e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| DatabaseError::UniqueViolation("registration code".into()))
            .into())
    }

    pub async fn list_codes(&self) -> Result<Vec<RegistrationCode>> {
        Ok(self.store.list_registration_codes().await?)
    }

    /// Remove a code. Agents that already used it are unaffected.
    pub async fn delete_code(&self, id: i64) -> Result<()> {
        if !self.store.delete_registration_code(id).await? {
            return Err(DispatchError::NotFound(format!("Registration code {}", id)));
        }
        tracing::info!(code_id = id, "Registration code deleted");
        Ok(())
    }

    /// Consume one use of `code` and bring the agent online with a token in
    /// a single step.
    ///
    /// A pending agent with the same name is approved in place; otherwise a
    /// new agent is created.
    pub async fn redeem(&self, code: &str, req: &RegisterRequest, ip: &str) -> Result<Agent> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(DispatchError::Validation("agent name is required".into()));
        }

        let _guard = self.code_locks.lock(&code.to_string()).await;
        let agent = NewAgent {
            name: name.to_string(),
            hostname: req.hostname.clone(),
            version: req.version.clone(),
            ip: ip.to_string(),
            status: AgentStatus::Online,
            token: Some(generate_token()),
            now: self.clock.now(),
        };

        match self.store.redeem_registration_code(code, &agent).await? {
            Redemption::Redeemed(agent) => {
                tracing::info!(
                    agent_id = agent.id,
                    name = %agent.name,
                    ip = %ip,
                    "Agent registered with registration code"
                );
                Ok(agent)
            }
            Redemption::NotFound => Err(DispatchError::NotFound("Registration code".into())),
            Redemption::Expired => Err(DispatchError::Expired),
            Redemption::Exhausted => Err(DispatchError::Exhausted),
        }
    }
}
