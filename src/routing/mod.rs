//! Call routing: deterministic selection of an agent persona for a call.
//!
//! Resolution is a pure function of the routing snapshot, the call tuple
//! (direction, called number, calling number), the wall clock, and the
//! per-agent live-call counts supplied by the caller. It performs no I/O.

pub mod table;

use chrono::{DateTime, Utc};

pub use table::{
    AgentProfile, BusinessHours, DirectionPolicy, RoutingKind, RoutingTable,
};

use crate::carrier::CallDirection;

/// Why a call was refused before any media flowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// The calling number is on the do-not-call set.
    DncBlock,
    /// No agent admits this direction inside its service window.
    MissingAgent,
    /// The selected agent is at its concurrent-call maximum.
    Overloaded,
}

impl RefusalReason {
    /// Stable reason string used in call records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DncBlock => "dnc_block",
            Self::MissingAgent => "missing_agent",
            Self::Overloaded => "overloaded",
        }
    }
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of routing resolution.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Connect the call to this agent.
    Route(AgentProfile),
    /// Forward the call to another number without opening a model session.
    Forward { number: String },
    /// Refuse the call.
    Refused(RefusalReason),
}

/// Select an agent for a call.
///
/// `live_calls` reports the current concurrent-call count per agent id.
/// Selection order: do-not-call check, direction and business-hours filter,
/// longest-prefix number mapping, tenant primary, then oldest by creation
/// time. Forward-routing agents yield [`Resolution::Forward`].
pub fn resolve(
    table: &RoutingTable,
    direction: CallDirection,
    called: &str,
    calling: &str,
    now: DateTime<Utc>,
    live_calls: impl Fn(&str) -> usize,
) -> Resolution {
    if table.do_not_call.contains(calling) {
        return Resolution::Refused(RefusalReason::DncBlock);
    }

    let mut candidates: Vec<&AgentProfile> = table
        .agents
        .iter()
        .filter(|a| a.active && a.direction_policy.admits(direction) && a.in_business_hours(now))
        .collect();
    candidates.sort_by_key(|a| a.created_at);

    if candidates.is_empty() {
        return Resolution::Refused(RefusalReason::MissingAgent);
    }

    let chosen = table
        .mapped_agent(called)
        .and_then(|id| candidates.iter().find(|a| a.id == id).copied())
        .or_else(|| candidates.iter().find(|a| a.primary).copied())
        .unwrap_or(candidates[0]);

    if chosen.routing == RoutingKind::Forward {
        match &chosen.forward_to {
            Some(number) => {
                return Resolution::Forward {
                    number: number.clone(),
                }
            }
            None => {
                tracing::warn!(agent = %chosen.id, "forward agent without target number");
                return Resolution::Refused(RefusalReason::MissingAgent);
            }
        }
    }

    if chosen.max_concurrent_calls > 0 && live_calls(&chosen.id) >= chosen.max_concurrent_calls {
        return Resolution::Refused(RefusalReason::Overloaded);
    }

    Resolution::Route(chosen.clone())
}
