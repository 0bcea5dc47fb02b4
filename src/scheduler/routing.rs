//! Collaborator seams consumed during scheduling
//!
//! Routing resolution, rate limiting, and the repo registry live outside
//! the core; the scheduler only sees these traits. The bundled defaults
//! are permissive so a hub runs stand-alone: everything routes to the
//! sidecar tier, nobody is rate-limited, every repo is active.

use crate::domain_types::{AgentId, RouteTarget, RouteTier, RoutingDecision};
use crate::queue::Task;
use async_trait::async_trait;
use std::sync::Arc;

/// What the routing resolver decided for a task
#[derive(Debug, Clone)]
pub enum RoutingOutcome {
    /// A concrete target; proceed with assignment
    Decision(RoutingDecision),
    /// No endpoint available at the preferred tier; retry higher after a
    /// short wait, degrading to capability matching in the meantime
    Fallback { tier: RouteTier, reason: String },
}

/// Tier resolution and endpoint selection
#[async_trait]
pub trait RoutingResolver: Send + Sync {
    /// Resolves a routing decision for `task`. `preferred_tier` is set when
    /// a fallback timer has escalated the request.
    async fn resolve(&self, task: &Task, preferred_tier: Option<RouteTier>) -> RoutingOutcome;
}

/// Read-only rate-limit table keyed by agent id
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn rate_limited(&self, agent_id: &AgentId) -> bool;
}

/// Active working-set registry
#[async_trait]
pub trait RepoRegistry: Send + Sync {
    async fn is_active(&self, repo: &str) -> bool;
}

/// Default resolver: everything is sidecar work at the preferred (or
/// standard) tier.
#[derive(Debug, Clone, Default)]
pub struct SidecarResolver;

#[async_trait]
impl RoutingResolver for SidecarResolver {
    async fn resolve(&self, _task: &Task, preferred_tier: Option<RouteTier>) -> RoutingOutcome {
        RoutingOutcome::Decision(RoutingDecision {
            target_type: RouteTarget::Sidecar,
            effective_tier: preferred_tier.unwrap_or(RouteTier::Standard),
            selected_endpoint: None,
            selected_model: None,
            fallback_used: false,
            candidate_count: None,
            classification_reason: Some("default sidecar routing".to_string()),
            estimated_cost_tier: None,
        })
    }
}

/// Default limiter: no agent is ever rate-limited
#[derive(Debug, Clone, Default)]
pub struct NoRateLimits;

#[async_trait]
impl RateLimiter for NoRateLimits {
    async fn rate_limited(&self, _agent_id: &AgentId) -> bool {
        false
    }
}

/// Default registry: every repo is active
#[derive(Debug, Clone, Default)]
pub struct AllReposActive;

#[async_trait]
impl RepoRegistry for AllReposActive {
    async fn is_active(&self, _repo: &str) -> bool {
        true
    }
}

/// The scheduler's external collaborators, bundled for injection
#[derive(Clone)]
pub struct SchedulerDeps {
    pub resolver: Arc<dyn RoutingResolver>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub repo_registry: Arc<dyn RepoRegistry>,
}

impl Default for SchedulerDeps {
    fn default() -> Self {
        Self {
            resolver: Arc::new(SidecarResolver),
            rate_limiter: Arc::new(NoRateLimits),
            repo_registry: Arc::new(AllReposActive),
        }
    }
}
