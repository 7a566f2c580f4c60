//! Filter chain: ordered predicates evaluated left-to-right over normalized
//! events. The first rejecting rule short-circuits; the rejection is counted
//! per rule and the event is not forwarded.
//!
//! Rules are enumerated variants rather than trait objects; extending the
//! chain means adding a variant.

use serde::{Deserialize, Serialize};

use ha_ingest_core::config::RouterConfig;
use ha_ingest_core::events::NormalizedEvent;

/// One filter predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterRule {
    /// Reject events whose domain is not in the list.
    DomainAllow(Vec<String>),
    /// Reject events whose domain is in the list.
    DomainDeny(Vec<String>),
    /// Reject specific entity ids.
    EntityDeny(Vec<String>),
    /// Reject events whose type is not in the list.
    EventTypeAllow(Vec<String>),
    /// Reject state changes into `unavailable`/`unknown`; those states carry
    /// no measurable value and would otherwise pollute the series.
    UnavailableStateDrop,
}

impl FilterRule {
    /// Stable label used for the per-filter rejection counter.
    pub fn name(&self) -> &'static str {
        match self {
            FilterRule::DomainAllow(_) => "domain_allow",
            FilterRule::DomainDeny(_) => "domain_deny",
            FilterRule::EntityDeny(_) => "entity_deny",
            FilterRule::EventTypeAllow(_) => "event_type_allow",
            FilterRule::UnavailableStateDrop => "unavailable_state_drop",
        }
    }

    pub fn accepts(&self, event: &NormalizedEvent) -> bool {
        match self {
            FilterRule::DomainAllow(domains) => domains.iter().any(|d| d == &event.domain),
            FilterRule::DomainDeny(domains) => !domains.iter().any(|d| d == &event.domain),
            FilterRule::EntityDeny(entities) => {
                !entities.iter().any(|e| e == &event.entity_id)
            }
            FilterRule::EventTypeAllow(types) => {
                types.iter().any(|t| t == &event.event_type)
            }
            FilterRule::UnavailableStateDrop => !matches!(
                event.new_state.as_deref(),
                Some("unavailable") | Some("unknown")
            ),
        }
    }
}

/// Ordered filter chain.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    rules: Vec<FilterRule>,
}

impl FilterChain {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        FilterChain { rules }
    }

    /// Chain derived from the router configuration. Empty lists configure
    /// no rule; order is deny, allow, then state hygiene.
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut rules = Vec::new();
        if !config.entity_deny.is_empty() {
            rules.push(FilterRule::EntityDeny(config.entity_deny.clone()));
        }
        if !config.domain_deny.is_empty() {
            rules.push(FilterRule::DomainDeny(config.domain_deny.clone()));
        }
        if !config.domain_allow.is_empty() {
            rules.push(FilterRule::DomainAllow(config.domain_allow.clone()));
        }
        if config.drop_unavailable {
            rules.push(FilterRule::UnavailableStateDrop);
        }
        FilterChain { rules }
    }

    /// `None` when every rule accepts; otherwise the name of the first
    /// rejecting rule.
    pub fn rejects(&self, event: &NormalizedEvent) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| !rule.accepts(event))
            .map(|rule| rule.name())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
