//! The structured `details` envelope handlers stream to operators.
//!
//! Every handler shares a common envelope inside the job's free-form
//! `details` map: a bounded console log, monotone progress, the current
//! phase name, per-step results, warnings, and error fields. Handler
//! input parameters and any extra output ride along in `extra` and are
//! preserved across merges.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The console log keeps the newest entries only.
pub const CONSOLE_LOG_LIMIT: usize = 100;

fn default_phase() -> String {
    "initializing".to_string()
}

/// Outcome of one named step inside a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub step: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsEnvelope {
    #[serde(default = "default_phase")]
    pub current_phase: String,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub console_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    /// Handler-specific fields, flattened into the same map.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DetailsEnvelope {
    fn default() -> Self {
        Self {
            current_phase: default_phase(),
            progress_percent: 0,
            console_log: Vec::new(),
            step_results: Vec::new(),
            warnings: Vec::new(),
            error: None,
            failed_phase: None,
            extra: Map::new(),
        }
    }
}

impl DetailsEnvelope {
    /// Seed the envelope from a job's existing details (input parameters
    /// become `extra`; a prior console log is preserved).
    pub fn from_details(details: Option<&Value>) -> Self {
        details
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Append a console line: `"[HH:MM:SS] LEVEL: msg"`. Oldest lines are
    /// evicted past the limit.
    pub fn console(&mut self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", Utc::now().format("%H:%M:%S"), level, message);
        self.console_log.push(line);
        if self.console_log.len() > CONSOLE_LOG_LIMIT {
            let overflow = self.console_log.len() - CONSOLE_LOG_LIMIT;
            self.console_log.drain(..overflow);
        }
    }

    /// Enter a phase. Progress is monotone: a smaller percentage never
    /// rewinds the bar.
    pub fn set_phase(&mut self, phase: &str, percent: u8) {
        self.current_phase = phase.to_string();
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    pub fn step(&mut self, step: &str, status: &str, message: impl Into<String>) {
        self.step_results.push(StepResult {
            step: step.to_string(),
            status: status.to_string(),
            message: message.into(),
        });
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Set a handler-specific field.
    pub fn set(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Deep-merge `patch` into `base`: objects merge recursively, everything
/// else is last-writer-wins at the leaf. Arrays are leaves.
pub fn merge_value(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_value(existing, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_console_log_bounded_keeps_newest() {
        let mut env = DetailsEnvelope::default();
        for i in 0..150 {
            env.console("INFO", &format!("line {i}"));
        }
        assert_eq!(env.console_log.len(), CONSOLE_LOG_LIMIT);
        assert!(env.console_log.first().unwrap().ends_with("line 50"));
        assert!(env.console_log.last().unwrap().ends_with("line 149"));
    }

    #[test]
    fn test_console_line_format() {
        let mut env = DetailsEnvelope::default();
        env.console("ERROR", "it broke");
        let line = &env.console_log[0];
        // "[HH:MM:SS] ERROR: it broke"
        assert_eq!(line.len(), "[00:00:00] ERROR: it broke".len());
        assert!(line.starts_with('['));
        assert_eq!(&line[9..], "] ERROR: it broke");
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut env = DetailsEnvelope::default();
        env.set_phase("clone", 20);
        assert_eq!(env.progress_percent, 20);
        env.set_phase("power_on", 10);
        assert_eq!(env.progress_percent, 20);
        assert_eq!(env.current_phase, "power_on");
        env.set_phase("complete", 100);
        assert_eq!(env.progress_percent, 100);
    }

    #[test]
    fn test_progress_caps_at_100() {
        let mut env = DetailsEnvelope::default();
        env.set_phase("done", 250);
        assert_eq!(env.progress_percent, 100);
    }

    #[test]
    fn test_from_details_preserves_inputs_and_log() {
        let env = DetailsEnvelope::from_details(Some(&json!({
            "action": "On",
            "console_log": ["[00:00:00] INFO: queued"],
            "progress_percent": 30,
        })));
        assert_eq!(env.get_str("action"), Some("On"));
        assert_eq!(env.console_log.len(), 1);
        assert_eq!(env.progress_percent, 30);
        assert_eq!(env.current_phase, "initializing");
    }

    #[test]
    fn test_envelope_round_trips_through_value() {
        let mut env = DetailsEnvelope::default();
        env.set_phase("wait_ip", 35);
        env.set("detected_ip", json!("10.1.2.3"));
        env.step("clone", "completed", "cloned template");

        let value = env.to_value();
        let back = DetailsEnvelope::from_details(Some(&value));
        assert_eq!(back.current_phase, "wait_ip");
        assert_eq!(back.get_str("detected_ip"), Some("10.1.2.3"));
        assert_eq!(back.step_results.len(), 1);
    }

    #[test]
    fn test_merge_deep_merges_objects() {
        let mut base = json!({
            "progress_percent": 20,
            "nested": {"keep": 1, "replace": 2},
            "console_log": ["a"],
        });
        merge_value(
            &mut base,
            &json!({
                "progress_percent": 30,
                "nested": {"replace": 3, "new": 4},
                "console_log": ["a", "b"],
            }),
        );
        assert_eq!(
            base,
            json!({
                "progress_percent": 30,
                "nested": {"keep": 1, "replace": 3, "new": 4},
                "console_log": ["a", "b"],
            })
        );
    }

    #[test]
    fn test_merge_replaces_scalars_and_arrays() {
        let mut base = json!({"a": [1, 2, 3], "b": "x"});
        merge_value(&mut base, &json!({"a": [9], "b": null}));
        assert_eq!(base, json!({"a": [9], "b": null}));
    }
}
