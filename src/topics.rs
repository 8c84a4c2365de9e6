//! Topic layout shared by every agent in the fleet.
//!
//! | topic                                        | direction | purpose                     |
//! |----------------------------------------------|-----------|-----------------------------|
//! | `<prefix>/agents/broadcast`                  | in        | fleet-wide commands         |
//! | `<prefix>/agents/<agent>/commands`           | in        | commands for one agent      |
//! | `<prefix>/agents/<agent>/status`             | out       | online / offline status     |
//! | `<prefix>/loadtests/<uuid>/manage`           | in        | run control (halt)          |
//! | `<prefix>/loadtests/<id>/results/<agent>`    | out       | per-request load-test data  |
//! | `<prefix>/loadtests/<id>/summary/<agent>`    | out       | end-of-run latency summary  |
//! | `<prefix>/<command>/<id>/results/<agent>`    | out       | health and task results     |
//! | `<prefix>/<fragment>/#`                      | in        | caller-requested wildcards  |

use regex::Regex;

lazy_static::lazy_static! {
    static ref MANAGE_TOPIC: Regex =
        Regex::new(r"/loadtests/([^/]+)/manage$").expect("valid manage topic pattern");
}

/// Builds topic names for one agent under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    agent_id: String,
}

impl TopicScheme {
    pub fn new(prefix: &str, agent_id: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn broadcast(&self) -> String {
        format!("{}/agents/broadcast", self.prefix)
    }

    pub fn direct(&self) -> String {
        format!("{}/agents/{}/commands", self.prefix, self.agent_id)
    }

    pub fn status(&self) -> String {
        format!("{}/agents/{}/status", self.prefix, self.agent_id)
    }

    pub fn loadtest_control(&self, uuid: &str) -> String {
        format!("{}/loadtests/{}/manage", self.prefix, uuid)
    }

    pub fn loadtest_results(&self, run_id: &str) -> String {
        format!("{}/loadtests/{}/results/{}", self.prefix, run_id, self.agent_id)
    }

    pub fn loadtest_summary(&self, run_id: &str) -> String {
        format!("{}/loadtests/{}/summary/{}", self.prefix, run_id, self.agent_id)
    }

    pub fn task_results(&self, command: &str, id: &str) -> String {
        format!("{}/{}/{}/results/{}", self.prefix, command, id, self.agent_id)
    }

    /// Wildcard subscription for a caller-supplied fragment.
    ///
    /// Returns `None` for empty fragments and fragments that already carry
    /// MQTT wildcard characters.
    pub fn wildcard(&self, fragment: &str) -> Option<String> {
        let fragment = fragment.trim_matches('/');
        if fragment.is_empty() || fragment.contains(['+', '#']) {
            return None;
        }
        Some(format!("{}/{}/#", self.prefix, fragment))
    }
}

/// Whether `value` can stand as exactly one topic level: non-empty, with no
/// separator or wildcard characters.
pub fn is_topic_level(value: &str) -> bool {
    !value.is_empty() && !value.contains(['/', '+', '#'])
}

/// Extract the run id from a `.../loadtests/<id>/manage` topic.
pub fn manage_topic_run_id(topic: &str) -> Option<&str> {
    MANAGE_TOPIC
        .captures(topic)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// MQTT-style filter matching: `+` matches one level, a trailing `#` matches
/// the parent level and everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
