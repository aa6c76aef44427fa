//! Recipient-based router.
//!
//! Precedence across all recipients (to + cc + bcc):
//! catch-all > direct-task > batched-intelligence > tenant-scoped > none.
//!
//! Tenant-scoped addresses look like `agentType+tenantToken@domain`. They
//! match when `agentType@domain` is a known address, and inherit that
//! address's lane.

use std::collections::HashSet;

use tracing::debug;

use crate::config::RoutingConfig;
use crate::pipeline::types::{Route, RouteDecision};

/// Static address tables. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Router {
    catch_all: HashSet<String>,
    direct_task: HashSet<String>,
    intelligence: HashSet<String>,
}

impl Router {
    pub fn new(config: &RoutingConfig) -> Self {
        let normalize = |list: &[String]| -> HashSet<String> {
            list.iter().map(|a| a.trim().to_lowercase()).collect()
        };
        Self {
            catch_all: normalize(&config.catch_all),
            direct_task: normalize(&config.direct_task),
            intelligence: normalize(&config.intelligence),
        }
    }

    /// Decide the lane for a message's recipients.
    pub fn route<'a, I>(&self, recipients: I) -> Route
    where
        I: IntoIterator<Item = &'a str>,
    {
        let recipients: Vec<String> = recipients
            .into_iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect();

        for decision in [
            RouteDecision::CatchAll,
            RouteDecision::DirectTask,
            RouteDecision::BatchedIntelligence,
        ] {
            if recipients.iter().any(|r| self.lane_of(r) == Some(decision)) {
                return Route::lane(decision);
            }
        }

        for recipient in &recipients {
            let Some((agent_type, tenant, base)) = split_tenant_address(recipient) else {
                continue;
            };
            if let Some(decision) = self.lane_of(&base) {
                debug!(
                    recipient = %recipient,
                    lane = decision.label(),
                    tenant_id = %tenant,
                    "Tenant-scoped address matched"
                );
                return Route {
                    decision,
                    tenant_id: Some(tenant),
                    agent_type: Some(agent_type),
                };
            }
        }

        Route::unrouted()
    }

    /// Lane of an exact (already lowercased) address.
    fn lane_of(&self, address: &str) -> Option<RouteDecision> {
        if self.catch_all.contains(address) {
            Some(RouteDecision::CatchAll)
        } else if self.direct_task.contains(address) {
            Some(RouteDecision::DirectTask)
        } else if self.intelligence.contains(address) {
            Some(RouteDecision::BatchedIntelligence)
        } else {
            None
        }
    }
}

/// Split `agent+tenant@domain` into `(agent, tenant, agent@domain)`.
pub fn split_tenant_address(address: &str) -> Option<(String, String, String)> {
    let (local, domain) = address.rsplit_once('@')?;
    let (agent, tenant) = local.split_once('+')?;
    if agent.is_empty() || tenant.is_empty() || domain.is_empty() {
        return None;
    }
    Some((
        agent.to_string(),
        tenant.to_string(),
        format!("{agent}@{domain}"),
    ))
}
