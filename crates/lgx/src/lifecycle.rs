//! 🧊 The index lifecycle compiler: a few ages and a size in, an ISM state chain out.
//!
//! 🎬 *[an index is born hot. it cools. it goes to the cold storage in the sky.
//! eventually somebody deletes it, and nobody says a word at the funeral.]*
//!
//! The chain is decided by a successor table, not by a pile of ifs:
//!
//! ```text
//!   hot  → warm | delete
//!   warm → cold | delete
//!   cold → delete
//! ```
//!
//! From each state the first successor whose age is configured wins. No
//! configured successor means the state is terminal. Delete reached from cold
//! uses `cold_delete`, because cold indices live somewhere a plain delete can't reach.

use serde::Deserialize;
use serde_json::{Map, Value, json};

/// ⚙️ `[lifecycle]` section. Every age is an engine duration string (`"30d"`, `"12h"`).
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub warm_age: Option<String>,
    #[serde(default)]
    pub cold_age: Option<String>,
    #[serde(default)]
    pub retain_age: Option<String>,
    #[serde(default)]
    pub rollover_age: Option<String>,
    /// 📏 e.g. `"30gb"`
    #[serde(default)]
    pub rollover_size: Option<String>,
    /// 🪪 defaults to `<index-prefix>-ism-policy`
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            warm_age: None,
            cold_age: None,
            retain_age: None,
            rollover_age: None,
            rollover_size: None,
            policy_id: None,
            timestamp_field: default_timestamp_field(),
        }
    }
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

impl LifecycleConfig {
    pub fn thresholds(&self) -> LifecycleThresholds {
        let get = |value: &Option<String>| value.as_deref().unwrap_or_default().to_string();
        LifecycleThresholds::new(
            &get(&self.warm_age),
            &get(&self.cold_age),
            &get(&self.retain_age),
            &get(&self.rollover_age),
            &get(&self.rollover_size),
        )
    }

    /// 📜 Everything the policy document needs besides the states.
    pub fn policy_meta(&self, index_prefix: &str) -> PolicyMeta {
        let alias = index_prefix.to_lowercase();
        PolicyMeta {
            policy_id: self
                .policy_id
                .clone()
                .unwrap_or_else(|| format!("{alias}-ism-policy")),
            description: format!("lgx lifecycle policy for {alias}"),
            index_patterns: vec![format!("{alias}-*")],
            priority: 100,
            timestamp_field: self.timestamp_field.clone(),
        }
    }
}

/// 🎚️ The compiler's input. Blank strings count as "not configured".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleThresholds {
    pub warm_age: Option<String>,
    pub cold_age: Option<String>,
    pub retain_age: Option<String>,
    pub rollover_age: Option<String>,
    pub rollover_size: Option<String>,
}

impl LifecycleThresholds {
    pub fn new(warm_age: &str, cold_age: &str, retain_age: &str, rollover_age: &str, rollover_size: &str) -> Self {
        let set = |value: &str| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        };
        Self {
            warm_age: set(warm_age),
            cold_age: set(cold_age),
            retain_age: set(retain_age),
            rollover_age: set(rollover_age),
            rollover_size: set(rollover_size),
        }
    }

    /// 🤔 Worth PUTting a policy at all?
    pub fn any(&self) -> bool {
        self.warm_age.is_some()
            || self.cold_age.is_some()
            || self.retain_age.is_some()
            || self.rollover_age.is_some()
            || self.rollover_size.is_some()
    }

    /// ⏳ The age that gates entry into `kind`. Hot has none, it's where you start.
    fn entry_age(&self, kind: StateKind) -> Option<&str> {
        match kind {
            StateKind::Hot => None,
            StateKind::Warm => self.warm_age.as_deref(),
            StateKind::Cold => self.cold_age.as_deref(),
            StateKind::Delete => self.retain_age.as_deref(),
        }
    }
}

/// 🌡️ The four temperatures of an index's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Hot,
    Warm,
    Cold,
    Delete,
}

impl StateKind {
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Hot => "hot",
            StateKind::Warm => "warm",
            StateKind::Cold => "cold",
            StateKind::Delete => "delete",
        }
    }

    /// 🗺️ Candidate next states, in order of preference.
    fn successors(&self) -> &'static [StateKind] {
        match self {
            StateKind::Hot => &[StateKind::Warm, StateKind::Delete],
            StateKind::Warm => &[StateKind::Cold, StateKind::Delete],
            StateKind::Cold => &[StateKind::Delete],
            StateKind::Delete => &[],
        }
    }
}

/// 🛠️ What the engine does on entering a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Rollover {
        min_primary_shard_size: Option<String>,
        min_index_age: Option<String>,
    },
    WarmMigration,
    ColdMigration,
    Delete,
    ColdDelete,
}

impl Action {
    fn to_json(&self, meta: &PolicyMeta) -> Value {
        let (name, body) = match self {
            Action::Rollover {
                min_primary_shard_size,
                min_index_age,
            } => {
                let mut conditions = Map::new();
                if let Some(size) = min_primary_shard_size {
                    conditions.insert("min_primary_shard_size".into(), json!(size));
                }
                if let Some(age) = min_index_age {
                    conditions.insert("min_index_age".into(), json!(age));
                }
                ("rollover", Value::Object(conditions))
            }
            Action::WarmMigration => ("warm_migration", json!({})),
            Action::ColdMigration => (
                "cold_migration",
                json!({ "start_time": null, "end_time": null, "timestamp_field": meta.timestamp_field, "ignore": "none" }),
            ),
            Action::Delete => ("delete", json!({})),
            Action::ColdDelete => ("cold_delete", json!({})),
        };
        let mut action = Map::new();
        action.insert("retry".into(), json!({ "count": 3, "backoff": "exponential", "delay": "1m" }));
        action.insert(name.into(), body);
        Value::Object(action)
    }
}

/// ➡️ Leave for `target` once the index is at least `min_index_age` old.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub target: StateKind,
    pub min_index_age: String,
}

/// 🧊 One compiled state. Immutable once `compile` hands it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleState {
    pub kind: StateKind,
    pub actions: Vec<Action>,
    pub transition: Option<Transition>,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn to_json(&self, meta: &PolicyMeta) -> Value {
        let transitions: Vec<Value> = self
            .transition
            .iter()
            .map(|t| json!({ "state_name": t.target.name(), "conditions": { "min_index_age": t.min_index_age } }))
            .collect();
        json!({
            "name": self.name(),
            "actions": self.actions.iter().map(|a| a.to_json(meta)).collect::<Vec<_>>(),
            "transitions": transitions,
        })
    }
}

/// 📜 Policy-level settings that are not part of the state chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMeta {
    pub policy_id: String,
    pub description: String,
    pub index_patterns: Vec<String>,
    pub priority: u32,
    pub timestamp_field: String,
}

fn actions_for(kind: StateKind, previous: Option<StateKind>, thresholds: &LifecycleThresholds) -> Vec<Action> {
    match kind {
        StateKind::Hot => vec![Action::Rollover {
            min_primary_shard_size: thresholds.rollover_size.clone(),
            min_index_age: thresholds.rollover_age.clone(),
        }],
        StateKind::Warm => vec![Action::WarmMigration],
        StateKind::Cold => vec![Action::ColdMigration],
        StateKind::Delete if previous == Some(StateKind::Cold) => vec![Action::ColdDelete],
        StateKind::Delete => vec![Action::Delete],
    }
}

/// 🧮 Thresholds → ordered state chain, starting at hot, 1 to 4 states long.
pub fn compile(thresholds: &LifecycleThresholds) -> Vec<LifecycleState> {
    let mut states = Vec::with_capacity(4);
    let mut previous = None;
    let mut current = StateKind::Hot;
    loop {
        let transition = current.successors().iter().find_map(|&next| {
            thresholds.entry_age(next).map(|age| Transition {
                target: next,
                min_index_age: age.to_string(),
            })
        });
        let next = transition.as_ref().map(|t| t.target);
        states.push(LifecycleState {
            kind: current,
            actions: actions_for(current, previous, thresholds),
            transition,
        });
        match next {
            Some(next) => {
                previous = Some(current);
                current = next;
            }
            None => return states,
        }
    }
}

/// 📜 Wrap compiled states into the body of `PUT _plugins/_ism/policies/{id}`.
pub fn policy_document(states: &[LifecycleState], meta: &PolicyMeta) -> Value {
    json!({
        "policy": {
            "description": meta.description,
            "default_state": StateKind::Hot.name(),
            "states": states.iter().map(|s| s.to_json(meta)).collect::<Vec<_>>(),
            "ism_template": {
                "index_patterns": meta.index_patterns,
                "priority": meta.priority,
            }
        }
    })
}
