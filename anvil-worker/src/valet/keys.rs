//! Coordination store key layout
//!
//! ```text
//! anvil/workers/<worker>/location              address of a live node
//! anvil/build_map/<build>                      worker that owns the build
//! anvil/builds/<worker>/<build>/current_stage  last stage started
//! anvil/builds/<worker>/<build>/stage_start    RFC 3339 start of that stage
//! anvil/builds/<worker>/<build>/backend_id     handle to tear down
//! ```

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const ROOT: &str = "anvil";

pub const CURRENT_STAGE: &str = "current_stage";
pub const STAGE_START: &str = "stage_start";
pub const BACKEND_ID: &str = "backend_id";

pub fn worker_prefix(worker_id: &str) -> String {
    format!("{}/workers/{}/", ROOT, worker_id)
}

pub fn worker_location(worker_id: &str) -> String {
    format!("{}location", worker_prefix(worker_id))
}

pub fn build_map(build_id: &str) -> String {
    format!("{}/build_map/{}", ROOT, build_id)
}

/// Prefix of every build a worker owns
pub fn worker_builds(worker_id: &str) -> String {
    format!("{}/builds/{}/", ROOT, worker_id)
}

pub fn build_prefix(worker_id: &str, build_id: &str) -> String {
    format!("{}{}/", worker_builds(worker_id), build_id)
}

pub fn build_field(worker_id: &str, build_id: &str, field: &str) -> String {
    format!("{}{}", build_prefix(worker_id, build_id), field)
}

/// What the coordination store knows about one build on a worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRuntime {
    pub build_id: String,
    pub current_stage: Option<String>,
    pub stage_start: Option<DateTime<Utc>>,
    pub backend_id: Option<String>,
}

/// Groups the entries under [`worker_builds`] into one runtime per build
pub fn parse_runtimes(worker_id: &str, entries: Vec<(String, Vec<u8>)>) -> Vec<BuildRuntime> {
    let prefix = worker_builds(worker_id);
    let mut runtimes: BTreeMap<String, BuildRuntime> = BTreeMap::new();

    for (key, value) in entries {
        let Some((build_id, field)) = key
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split_once('/'))
        else {
            continue;
        };

        let runtime = runtimes
            .entry(build_id.to_string())
            .or_insert_with(|| BuildRuntime {
                build_id: build_id.to_string(),
                ..Default::default()
            });
        let value = String::from_utf8_lossy(&value).to_string();

        match field {
            CURRENT_STAGE => runtime.current_stage = Some(value),
            STAGE_START => {
                runtime.stage_start = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            BACKEND_ID if !value.is_empty() => runtime.backend_id = Some(value),
            _ => {}
        }
    }

    runtimes.into_values().collect()
}
