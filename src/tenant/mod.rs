//! Tenant context carrier
//!
//! Every unit of asynchronous work carries organization and user identity
//! from the point of scheduling to the point of execution. The identity
//! travels as out-of-band envelope headers, separate from the task arguments,
//! and is installed as a task-local scope for the duration of the unit.

use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Tenant errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    #[error("Missing tenant metadata: {0}")]
    Missing(&'static str),
}

/// Organization/user identity used for row-level isolation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: String,
    pub user_id: String,
}

impl TenantContext {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Authenticated caller identity, as resolved by the API layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthIdentity {
    pub organization_id: Option<String>,
    pub user_id: String,
}

/// Out-of-band metadata attached to a scheduled task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHeaders {
    pub task_id: String,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
}

/// Task arguments plus the headers that travel with them through the queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope<T> {
    pub headers: TaskHeaders,
    pub args: T,
}

impl<T> TaskEnvelope<T> {
    /// Wrap caller arguments for scheduling.
    ///
    /// Explicitly supplied identifiers win; anything left unset is taken from
    /// the authenticated identity.
    pub fn schedule(
        args: T,
        explicit: Option<&TenantContext>,
        identity: Option<&AuthIdentity>,
    ) -> Result<Self, TenantError> {
        let organization_id = explicit
            .map(|t| t.organization_id.clone())
            .or_else(|| identity.and_then(|i| i.organization_id.clone()));
        let user_id = explicit
            .map(|t| t.user_id.clone())
            .or_else(|| identity.map(|i| i.user_id.clone()));

        let headers = TaskHeaders {
            task_id: crate::utils::new_id(),
            organization_id,
            user_id,
        };
        let envelope = Self { headers, args };
        envelope.tenant()?;
        Ok(envelope)
    }

    /// Read the tenant back out of the headers
    pub fn tenant(&self) -> Result<TenantContext, TenantError> {
        let organization_id = self
            .headers
            .organization_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(TenantError::Missing("organization_id"))?;
        let user_id = self
            .headers
            .user_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(TenantError::Missing("user_id"))?;
        Ok(TenantContext::new(organization_id, user_id))
    }

    pub fn task_id(&self) -> &str {
        &self.headers.task_id
    }
}

/// Run `fut` with `tenant` installed as the current tenant.
///
/// The scope is released when the future completes, is dropped, or unwinds,
/// so a reused worker never observes a previous unit's tenant.
pub async fn scope<F>(tenant: TenantContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(tenant, fut).await
}

/// The tenant installed by the enclosing [`scope`], if any
pub fn current() -> Option<TenantContext> {
    CURRENT_TENANT.try_with(|tenant| tenant.clone()).ok()
}
