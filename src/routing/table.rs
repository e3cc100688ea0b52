//! Routing table snapshot: agent profiles, number mappings, do-not-call set.
//!
//! The table is a read-mostly immutable snapshot. Call setup reads whatever
//! snapshot is current; table updates swap the whole snapshot and never
//! mutate one in place, so in-flight calls keep the configuration they
//! resolved with.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::carrier::CallDirection;
use crate::model::{SessionSettings, SettingsError, VadTuning};

/// Which call directions an agent accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionPolicy {
    Inbound,
    Outbound,
    Both,
}

impl DirectionPolicy {
    pub fn admits(&self, direction: CallDirection) -> bool {
        matches!(
            (self, direction),
            (Self::Both, _)
                | (Self::Inbound, CallDirection::Inbound)
                | (Self::Outbound, CallDirection::Outbound)
        )
    }
}

/// How a call routed to the agent is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    /// Connect the caller to the agent persona.
    Direct,
    /// Menu-style agent; still connects to the persona.
    Menu,
    /// Forward the call to another number instead of connecting.
    Forward,
}

/// Daily service window in the agent's local time.
///
/// Windows with `open == close` are treated as always open; windows that
/// wrap midnight (`close < open`) are honored as overnight windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// Minutes since local midnight, inclusive.
    pub open_minute: u32,
    /// Minutes since local midnight, exclusive.
    pub close_minute: u32,
}

impl BusinessHours {
    pub fn contains(&self, local: &DateTime<FixedOffset>) -> bool {
        if self.open_minute == self.close_minute {
            return true;
        }
        let minute = local.hour() * 60 + local.minute();
        if self.open_minute < self.close_minute {
            minute >= self.open_minute && minute < self.close_minute
        } else {
            minute >= self.open_minute || minute < self.close_minute
        }
    }
}

/// One agent persona as configured by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    /// Voice name from the model's enumerated set.
    pub voice: String,
    /// BCP-47 language code.
    pub language: String,
    pub system_prompt: String,
    /// Model name from the enumerated allowed set.
    pub model: String,
    pub vad: VadTuning,
    pub direction_policy: DirectionPolicy,
    pub routing: RoutingKind,
    /// Target number when `routing == Forward`.
    pub forward_to: Option<String>,
    pub business_hours: Option<BusinessHours>,
    /// UTC offset like "+05:30"; parse failures fall back to UTC.
    pub timezone: String,
    pub max_concurrent_calls: usize,
    /// Preferred agent for the tenant when no mapping names one.
    pub primary: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Request sliding-window context compression for extended sessions.
    pub extended_sessions: bool,
}

impl AgentProfile {
    /// Freeze this profile into validated per-call session settings.
    pub fn session_settings(&self) -> Result<SessionSettings, SettingsError> {
        SessionSettings::builder()
            .model(&self.model)
            .voice(&self.voice)
            .language(&self.language)
            .system_prompt(&self.system_prompt)
            .vad(self.vad)
            .context_compression(self.extended_sessions)
            .build()
    }

    /// Is this agent inside its service window at `now`?
    pub fn in_business_hours(&self, now: DateTime<Utc>) -> bool {
        let Some(hours) = self.business_hours else {
            return true;
        };
        let offset = parse_utc_offset(&self.timezone).unwrap_or_else(|| {
            tracing::warn!(
                agent = %self.id,
                timezone = %self.timezone,
                "unparseable timezone, evaluating business hours in UTC"
            );
            FixedOffset::east_opt(0).expect("zero offset")
        });
        hours.contains(&now.with_timezone(&offset))
    }
}

/// Parse a "+HH:MM" / "-HH:MM" / "UTC" style offset.
fn parse_utc_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1i32, &tz[1..]),
        b'-' => (-1i32, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Immutable routing snapshot used for one call resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    pub agents: Vec<AgentProfile>,
    /// Called-number prefix → agent id; the longest matching prefix wins.
    pub number_mappings: HashMap<String, String>,
    /// Calling numbers that must never be connected.
    pub do_not_call: HashSet<String>,
}

impl RoutingTable {
    /// Longest-prefix mapping lookup for a called number.
    pub fn mapped_agent(&self, called: &str) -> Option<&str> {
        self.number_mappings
            .iter()
            .filter(|(prefix, _)| called.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, id)| id.as_str())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn test_agent(id: &str) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            name: format!("agent {id}"),
            voice: "Puck".into(),
            language: "en-US".into(),
            system_prompt: "Answer helpfully.".into(),
            model: "gemini-2.0-flash-live-001".into(),
            vad: VadTuning::default(),
            direction_policy: DirectionPolicy::Both,
            routing: RoutingKind::Direct,
            forward_to: None,
            business_hours: None,
            timezone: "UTC".into(),
            max_concurrent_calls: 10,
            primary: false,
            active: true,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            extended_sessions: false,
        }
    }

    #[test]
    fn business_hours_regular_window() {
        let hours = BusinessHours {
            open_minute: 9 * 60,
            close_minute: 17 * 60,
        };
        let offset = FixedOffset::east_opt(0).unwrap();
        let inside = offset.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let outside = offset.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).unwrap();
        assert!(hours.contains(&inside));
        assert!(!hours.contains(&outside));
    }

    #[test]
    fn business_hours_overnight_window() {
        let hours = BusinessHours {
            open_minute: 22 * 60,
            close_minute: 6 * 60,
        };
        let offset = FixedOffset::east_opt(0).unwrap();
        let late = offset.with_ymd_and_hms(2025, 6, 2, 23, 0, 0).unwrap();
        let early = offset.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let midday = offset.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        assert!(hours.contains(&late));
        assert!(hours.contains(&early));
        assert!(!hours.contains(&midday));
    }

    #[test]
    fn ambiguous_window_is_open() {
        let hours = BusinessHours {
            open_minute: 540,
            close_minute: 540,
        };
        let offset = FixedOffset::east_opt(0).unwrap();
        let any = offset.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap();
        assert!(hours.contains(&any));
    }

    #[test]
    fn timezone_offsets_shift_the_window() {
        let mut agent = test_agent("a");
        agent.business_hours = Some(BusinessHours {
            open_minute: 9 * 60,
            close_minute: 17 * 60,
        });
        agent.timezone = "+05:30".into();
        // 05:00 UTC is 10:30 in +05:30: inside the window.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        assert!(agent.in_business_hours(now));
        // 14:00 UTC is 19:30 local: outside.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        assert!(!agent.in_business_hours(now));
    }

    #[test]
    fn bad_timezone_falls_back_to_utc() {
        let mut agent = test_agent("a");
        agent.business_hours = Some(BusinessHours {
            open_minute: 9 * 60,
            close_minute: 17 * 60,
        });
        agent.timezone = "Mars/Olympus".into();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        assert!(agent.in_business_hours(now));
    }

    #[test]
    fn longest_prefix_mapping_wins() {
        let mut table = RoutingTable::default();
        table
            .number_mappings
            .insert("+1555".to_string(), "wide".to_string());
        table
            .number_mappings
            .insert("+1555000".to_string(), "narrow".to_string());
        assert_eq!(table.mapped_agent("+15550001111"), Some("narrow"));
        assert_eq!(table.mapped_agent("+15559990000"), Some("wide"));
        assert_eq!(table.mapped_agent("+4420"), None);
    }

    #[test]
    fn profile_builds_session_settings() {
        let settings = test_agent("a").session_settings().unwrap();
        assert_eq!(settings.voice.as_str(), "Puck");
        assert_eq!(settings.model.as_str(), "gemini-2.0-flash-live-001");
    }

    #[test]
    fn invalid_voice_fails_at_build() {
        let mut agent = test_agent("a");
        agent.voice = "alloy".into();
        assert!(matches!(
            agent.session_settings(),
            Err(SettingsError::UnknownVoice(_))
        ));
    }
}
