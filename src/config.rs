//! Validated, immutable configuration a policy instance is built from.

use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;

/// What to do when the LB service reports a server list with zero entries.
///
/// The upstream protocol leaves this unspecified; this crate resolves it as
/// a configurable policy rather than a hardcoded choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyServerListPolicy {
    /// Keep the previously adopted RR (if any) serving picks; an empty list
    /// never triggers a swap. This is the default: a transient empty list
    /// from the LB service should not interrupt already-flowing traffic.
    #[default]
    KeepServing,
    /// Tear down the current RR (if any) and leave new picks enqueued,
    /// as if no RR had ever been adopted.
    MarkUnavailable,
}

/// The validated, immutable configuration a `grpclb` policy instance is
/// built from.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GrpclbConfig {
    /// Name of the target service the client wants to load balance for,
    /// sent as `InitialLoadBalanceRequest.name`.
    pub service_name: String,

    /// Priority-ordered, comma-joinable list of balancer addresses (the
    /// channel args' LB-addresses entries with `is_balancer=true`).
    pub balancer_addresses: Vec<String>,

    /// Backoff parameters governing LB session reconnection.
    pub backoff: BackoffPolicy,

    /// Behavior on an affirmatively empty decoded server list.
    pub empty_server_list_policy: EmptyServerListPolicy,
}

impl GrpclbConfig {
    /// Validate and build a configuration.
    ///
    /// Mirrors the factory precondition (§6.3 in the design notes): at least
    /// one balancer address is required, and the service name must be
    /// non-empty.
    pub fn new(service_name: impl Into<String>, balancer_addresses: Vec<String>) -> Result<Self> {
        let service_name = service_name.into();
        if service_name.is_empty() {
            return Err(Error::InvalidConfig(
                "service_name must not be empty".into(),
            ));
        }
        if balancer_addresses.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one balancer address is required".into(),
            ));
        }
        Ok(Self {
            service_name,
            balancer_addresses,
            backoff: BackoffPolicy::default(),
            empty_server_list_policy: EmptyServerListPolicy::default(),
        })
    }

    /// Override the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the empty-server-list policy.
    pub fn with_empty_server_list_policy(mut self, policy: EmptyServerListPolicy) -> Self {
        self.empty_server_list_policy = policy;
        self
    }

    /// The first balancer address, used to open the LB channel.
    ///
    /// Only the first address is dialed directly today; fallback across the
    /// full priority-ordered list is left to the ambient channel/resolver
    /// stack, consistent with this crate's scope (§1).
    pub fn primary_balancer_address(&self) -> &str {
        &self.balancer_addresses[0]
    }
}
