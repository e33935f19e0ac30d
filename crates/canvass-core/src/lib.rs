use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const MAX_PRIORITY_SCORE: u8 = 100;

pub const MUTABLE_FIELDS: &[&str] = &[
    "priority_score",
    "target_households",
    "demographic_profile",
    "key_issues",
    "recommended_script",
    "performance_metrics",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecinctId(String);

impl PrecinctId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PrecinctId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PrecinctId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for PrecinctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to load precinct data: {0}")]
    Load(String),
    #[error("no precinct with id '{0}'")]
    NotFound(PrecinctId),
    #[error("invalid update: {0}")]
    Validation(String),
    #[error("failed to persist precinct data: {0}")]
    Persist(String),
}

/// Update payload for [`PrecinctStore::update_precinct`]: field name to new
/// value. Keys must name mutable fields; unknown keys are rejected, not
/// ignored.
pub type PrecinctChanges = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precinct {
    pub precinct_id: PrecinctId,
    pub priority_score: u8,
    pub target_households: u64,
    pub demographic_profile: String,
    // Missing or null in the backing file reads as an empty list; always
    // written back as a JSON array.
    #[serde(default, deserialize_with = "null_as_empty_list")]
    pub key_issues: Vec<String>,
    pub recommended_script: String,
    pub performance_metrics: serde_json::Map<String, Value>,
}

fn null_as_empty_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

impl Precinct {
    /// Merges `changes` into this record. The whole payload is validated
    /// before any field is assigned, so a failed merge leaves the record
    /// untouched.
    pub fn apply_changes(&mut self, changes: &PrecinctChanges) -> Result<(), StoreError> {
        let parsed = ParsedChanges::from_payload(changes)?;

        if let Some(score) = parsed.priority_score {
            self.priority_score = score;
        }
        if let Some(households) = parsed.target_households {
            self.target_households = households;
        }
        if let Some(profile) = parsed.demographic_profile {
            self.demographic_profile = profile;
        }
        if let Some(issues) = parsed.key_issues {
            self.key_issues = issues;
        }
        if let Some(script) = parsed.recommended_script {
            self.recommended_script = script;
        }
        if let Some(metrics) = parsed.performance_metrics {
            self.performance_metrics = metrics;
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ParsedChanges {
    priority_score: Option<u8>,
    target_households: Option<u64>,
    demographic_profile: Option<String>,
    key_issues: Option<Vec<String>>,
    recommended_script: Option<String>,
    performance_metrics: Option<serde_json::Map<String, Value>>,
}

impl ParsedChanges {
    fn from_payload(changes: &PrecinctChanges) -> Result<Self, StoreError> {
        let mut parsed = Self::default();

        for (field, value) in changes {
            match field.as_str() {
                "priority_score" => {
                    let score: u8 = parse_field(field, value)?;
                    if score > MAX_PRIORITY_SCORE {
                        return Err(StoreError::Validation(format!(
                            "priority_score {score} is outside 0..={MAX_PRIORITY_SCORE}"
                        )));
                    }
                    parsed.priority_score = Some(score);
                }
                "target_households" => {
                    parsed.target_households = Some(parse_field(field, value)?);
                }
                "demographic_profile" => {
                    parsed.demographic_profile = Some(parse_field(field, value)?);
                }
                "key_issues" => {
                    let issues: Option<Vec<String>> = parse_field(field, value)?;
                    parsed.key_issues = Some(issues.unwrap_or_default());
                }
                "recommended_script" => {
                    parsed.recommended_script = Some(parse_field(field, value)?);
                }
                "performance_metrics" => {
                    parsed.performance_metrics = Some(parse_field(field, value)?);
                }
                "precinct_id" => {
                    return Err(StoreError::Validation(
                        "precinct_id is immutable and cannot appear in an update payload"
                            .to_owned(),
                    ));
                }
                unknown => {
                    return Err(StoreError::Validation(format!(
                        "unknown field '{unknown}' in update payload; mutable fields are: {}",
                        MUTABLE_FIELDS.join(", ")
                    )));
                }
            }
        }

        Ok(parsed)
    }
}

fn parse_field<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, StoreError> {
    serde_json::from_value(value.clone()).map_err(|err| {
        StoreError::Validation(format!("invalid value for field '{field}': {err}"))
    })
}

pub trait PrecinctStore {
    fn get_all_precincts(&self) -> &[Precinct];
    fn get_precinct(&self, id: &PrecinctId) -> Result<&Precinct, StoreError>;
    fn update_precinct(
        &mut self,
        id: &PrecinctId,
        changes: &PrecinctChanges,
    ) -> Result<Precinct, StoreError>;
}

/// Flat-JSON-file precinct store: the entire array is held in memory and
/// rewritten to the same file on every update. Single writer, no locking;
/// in-process callers that might interleave go through
/// [`SharedPrecinctStore`].
pub struct JsonFileStore {
    path: PathBuf,
    records: Vec<Precinct>,
}

impl JsonFileStore {
    /// Loads the backing file all-or-nothing: any read, parse, or
    /// required-field failure yields [`StoreError::Load`] and no store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            StoreError::Load(format!("failed to read '{}': {err}", path.display()))
        })?;
        let records: Vec<Precinct> = serde_json::from_str(&raw).map_err(|err| {
            StoreError::Load(format!(
                "invalid precinct data in '{}': {err}",
                path.display()
            ))
        })?;

        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.precinct_id.clone()) {
                tracing::warn!(
                    precinct_id = record.precinct_id.as_str(),
                    "duplicate precinct_id in backing file; lookups use the first match"
                );
            }
        }

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "loaded precinct store"
        );
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut rendered = serde_json::to_vec_pretty(&self.records).map_err(|err| {
            StoreError::Persist(format!("failed to serialize precinct data: {err}"))
        })?;
        rendered.push(b'\n');

        // Temp-file-and-rename so a failed write never leaves the backing
        // file partially overwritten.
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "precincts.json".to_owned());
        let tmp = self
            .path
            .with_file_name(format!("{file_name}.tmp.{}", std::process::id()));

        std::fs::write(&tmp, &rendered).map_err(|err| {
            StoreError::Persist(format!("failed to write '{}': {err}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|err| {
            let _ = std::fs::remove_file(&tmp);
            StoreError::Persist(format!(
                "failed to replace '{}': {err}",
                self.path.display()
            ))
        })
    }

    fn position(&self, id: &PrecinctId) -> Option<usize> {
        // First match in storage order wins if the file somehow carries
        // duplicate ids.
        self.records
            .iter()
            .position(|record| record.precinct_id == *id)
    }
}

impl PrecinctStore for JsonFileStore {
    fn get_all_precincts(&self) -> &[Precinct] {
        &self.records
    }

    fn get_precinct(&self, id: &PrecinctId) -> Result<&Precinct, StoreError> {
        self.position(id)
            .map(|index| &self.records[index])
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn update_precinct(
        &mut self,
        id: &PrecinctId,
        changes: &PrecinctChanges,
    ) -> Result<Precinct, StoreError> {
        let index = self
            .position(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut updated = self.records[index].clone();
        updated.apply_changes(changes)?;

        let previous = std::mem::replace(&mut self.records[index], updated.clone());
        if let Err(err) = self.persist() {
            // Roll back so the in-memory copy never diverges from disk.
            self.records[index] = previous;
            return Err(err);
        }

        let fields = changes.keys().cloned().collect::<Vec<_>>().join(", ");
        tracing::info!(
            precinct_id = id.as_str(),
            fields = fields.as_str(),
            "updated precinct"
        );
        Ok(updated)
    }
}

/// Mutual-exclusion guard around the store for in-process callers: every
/// read-modify-write-back sequence runs under one lock, so interleaved
/// updates cannot corrupt the backing file.
#[derive(Clone)]
pub struct SharedPrecinctStore {
    inner: Arc<Mutex<JsonFileStore>>,
}

impl SharedPrecinctStore {
    pub fn new(store: JsonFileStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(JsonFileStore::open(path)?))
    }

    pub fn get_all_precincts(&self) -> Vec<Precinct> {
        self.lock().get_all_precincts().to_vec()
    }

    pub fn get_precinct(&self, id: &PrecinctId) -> Result<Precinct, StoreError> {
        self.lock().get_precinct(id).cloned()
    }

    pub fn update_precinct(
        &self,
        id: &PrecinctId,
        changes: &PrecinctChanges,
    ) -> Result<Precinct, StoreError> {
        self.lock().update_precinct(id, changes)
    }

    fn lock(&self) -> MutexGuard<'_, JsonFileStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "canvass-core-{prefix}-{nanos}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    fn remove_temp_path(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    fn sample_records() -> Value {
        json!([
            {
                "precinct_id": "P1",
                "priority_score": 40,
                "target_households": 100,
                "demographic_profile": "suburban",
                "key_issues": ["schools"],
                "recommended_script": "Hi, I'm...",
                "performance_metrics": {"calls_made": 10}
            },
            {
                "precinct_id": "P2",
                "priority_score": 88,
                "target_households": 2577,
                "demographic_profile": "urban renters, high turnover",
                "key_issues": ["transit", "rent"],
                "recommended_script": "Good evening...",
                "performance_metrics": {"calls_made": 3, "doors_knocked": 41}
            }
        ])
    }

    fn write_backing_file(dir: &Path, records: &Value) -> PathBuf {
        let path = dir.join("precincts.json");
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(records).expect("serialize fixture"),
        )
        .expect("write fixture");
        path
    }

    fn changes(entries: &[(&str, Value)]) -> PrecinctChanges {
        entries
            .iter()
            .map(|(field, value)| ((*field).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn get_all_matches_backing_file_contents() {
        let dir = unique_temp_dir("round-trip");
        let path = write_backing_file(&dir, &sample_records());

        let store = JsonFileStore::open(&path).expect("open store");
        let records = store.get_all_precincts();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].precinct_id, PrecinctId::from("P1"));
        assert_eq!(records[0].priority_score, 40);
        assert_eq!(records[0].key_issues, vec!["schools"]);
        assert_eq!(records[1].precinct_id, PrecinctId::from("P2"));
        assert_eq!(records[1].target_households, 2577);
        assert_eq!(
            records[1].performance_metrics.get("doors_knocked"),
            Some(&json!(41))
        );

        remove_temp_path(&dir);
    }

    #[test]
    fn lookup_finds_every_loaded_id_and_rejects_unknown() {
        let dir = unique_temp_dir("lookup");
        let path = write_backing_file(&dir, &sample_records());
        let store = JsonFileStore::open(&path).expect("open store");

        for id in ["P1", "P2"] {
            let record = store.get_precinct(&PrecinctId::from(id)).expect("lookup");
            assert_eq!(record.precinct_id.as_str(), id);
        }

        let missing = store.get_precinct(&PrecinctId::from("UNKNOWN"));
        assert!(matches!(missing, Err(StoreError::NotFound(id)) if id.as_str() == "UNKNOWN"));

        remove_temp_path(&dir);
    }

    #[test]
    fn update_merges_named_fields_and_leaves_the_rest() {
        let dir = unique_temp_dir("merge");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");

        store
            .update_precinct(
                &PrecinctId::from("P1"),
                &changes(&[
                    ("priority_score", json!(75)),
                    ("key_issues", json!(["schools", "transit"])),
                ]),
            )
            .expect("update");

        let record = store.get_precinct(&PrecinctId::from("P1")).expect("lookup");
        assert_eq!(record.priority_score, 75);
        assert_eq!(record.key_issues, vec!["schools", "transit"]);
        assert_eq!(record.target_households, 100);
        assert_eq!(record.demographic_profile, "suburban");
        assert_eq!(record.recommended_script, "Hi, I'm...");
        assert_eq!(
            record.performance_metrics.get("calls_made"),
            Some(&json!(10))
        );

        remove_temp_path(&dir);
    }

    #[test]
    fn update_is_idempotent() {
        let dir = unique_temp_dir("idempotent");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");
        let payload = changes(&[
            ("priority_score", json!(75)),
            ("demographic_profile", json!("suburban families")),
        ]);

        store
            .update_precinct(&PrecinctId::from("P1"), &payload)
            .expect("first update");
        let first = store
            .get_precinct(&PrecinctId::from("P1"))
            .expect("lookup")
            .clone();
        let first_bytes = std::fs::read(&path).expect("read file");

        store
            .update_precinct(&PrecinctId::from("P1"), &payload)
            .expect("second update");
        let second = store
            .get_precinct(&PrecinctId::from("P1"))
            .expect("lookup")
            .clone();
        let second_bytes = std::fs::read(&path).expect("read file");

        assert_eq!(first, second);
        assert_eq!(first_bytes, second_bytes);

        remove_temp_path(&dir);
    }

    #[test]
    fn update_does_not_touch_other_precincts() {
        let dir = unique_temp_dir("isolation");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");
        let untouched = store
            .get_precinct(&PrecinctId::from("P2"))
            .expect("lookup")
            .clone();

        store
            .update_precinct(
                &PrecinctId::from("P1"),
                &changes(&[("priority_score", json!(99))]),
            )
            .expect("update");

        assert_eq!(
            store
                .get_precinct(&PrecinctId::from("P2"))
                .expect("lookup")
                .clone(),
            untouched
        );

        remove_temp_path(&dir);
    }

    #[test]
    fn update_survives_reload_from_the_same_file() {
        let dir = unique_temp_dir("durability");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");

        store
            .update_precinct(
                &PrecinctId::from("P1"),
                &changes(&[("recommended_script", json!("New script."))]),
            )
            .expect("update");
        drop(store);

        let reloaded = JsonFileStore::open(&path).expect("reopen store");
        let record = reloaded
            .get_precinct(&PrecinctId::from("P1"))
            .expect("lookup");
        assert_eq!(record.recommended_script, "New script.");
        assert_eq!(record.priority_score, 40);

        remove_temp_path(&dir);
    }

    #[test]
    fn unknown_id_update_leaves_file_byte_for_byte_unchanged() {
        let dir = unique_temp_dir("unknown-id");
        let path = write_backing_file(&dir, &sample_records());
        let before = std::fs::read(&path).expect("read file");
        let mut store = JsonFileStore::open(&path).expect("open store");

        let result = store.update_precinct(
            &PrecinctId::from("UNKNOWN"),
            &changes(&[("priority_score", json!(10))]),
        );

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(std::fs::read(&path).expect("read file"), before);

        remove_temp_path(&dir);
    }

    #[test]
    fn unknown_field_is_rejected_and_nothing_persists() {
        let dir = unique_temp_dir("unknown-field");
        let path = write_backing_file(&dir, &sample_records());
        let before = std::fs::read(&path).expect("read file");
        let mut store = JsonFileStore::open(&path).expect("open store");

        let result = store.update_precinct(
            &PrecinctId::from("P1"),
            &changes(&[
                ("priority_score", json!(75)),
                ("turnout_projection", json!(0.61)),
            ]),
        );

        assert!(matches!(result, Err(StoreError::Validation(_))));
        let record = store.get_precinct(&PrecinctId::from("P1")).expect("lookup");
        assert_eq!(record.priority_score, 40);
        assert_eq!(std::fs::read(&path).expect("read file"), before);

        remove_temp_path(&dir);
    }

    #[test]
    fn precinct_id_is_immutable_in_update_payloads() {
        let dir = unique_temp_dir("immutable-id");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");

        let result = store.update_precinct(
            &PrecinctId::from("P1"),
            &changes(&[("precinct_id", json!("P9"))]),
        );

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(store.get_precinct(&PrecinctId::from("P1")).is_ok());

        remove_temp_path(&dir);
    }

    #[test]
    fn priority_score_outside_range_is_rejected() {
        let dir = unique_temp_dir("score-range");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");

        let result = store.update_precinct(
            &PrecinctId::from("P1"),
            &changes(&[("priority_score", json!(101))]),
        );

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(
            store
                .get_precinct(&PrecinctId::from("P1"))
                .expect("lookup")
                .priority_score,
            40
        );

        remove_temp_path(&dir);
    }

    #[test]
    fn missing_or_null_key_issues_loads_as_empty_list() {
        let dir = unique_temp_dir("key-issues");
        let records = json!([
            {
                "precinct_id": "P1",
                "priority_score": 10,
                "target_households": 5,
                "demographic_profile": "rural",
                "key_issues": null,
                "recommended_script": "Hello.",
                "performance_metrics": {}
            },
            {
                "precinct_id": "P2",
                "priority_score": 20,
                "target_households": 6,
                "demographic_profile": "rural",
                "recommended_script": "Hello.",
                "performance_metrics": {}
            }
        ]);
        let path = write_backing_file(&dir, &records);

        let store = JsonFileStore::open(&path).expect("open store");
        assert!(store
            .get_precinct(&PrecinctId::from("P1"))
            .expect("lookup")
            .key_issues
            .is_empty());
        assert!(store
            .get_precinct(&PrecinctId::from("P2"))
            .expect("lookup")
            .key_issues
            .is_empty());

        remove_temp_path(&dir);
    }

    #[test]
    fn duplicate_ids_resolve_to_first_match_in_storage_order() {
        let dir = unique_temp_dir("duplicates");
        let records = json!([
            {
                "precinct_id": "P1",
                "priority_score": 1,
                "target_households": 1,
                "demographic_profile": "first",
                "key_issues": [],
                "recommended_script": "",
                "performance_metrics": {}
            },
            {
                "precinct_id": "P1",
                "priority_score": 2,
                "target_households": 2,
                "demographic_profile": "second",
                "key_issues": [],
                "recommended_script": "",
                "performance_metrics": {}
            }
        ]);
        let path = write_backing_file(&dir, &records);

        let store = JsonFileStore::open(&path).expect("open store");
        let record = store.get_precinct(&PrecinctId::from("P1")).expect("lookup");
        assert_eq!(record.demographic_profile, "first");

        remove_temp_path(&dir);
    }

    #[test]
    fn open_fails_all_or_nothing() {
        let dir = unique_temp_dir("load-failures");

        let missing = JsonFileStore::open(dir.join("absent.json"));
        assert!(matches!(missing, Err(StoreError::Load(_))));

        let invalid = dir.join("invalid.json");
        std::fs::write(&invalid, b"[{\"precinct_id\": ").expect("write fixture");
        assert!(matches!(
            JsonFileStore::open(&invalid),
            Err(StoreError::Load(_))
        ));

        let incomplete = dir.join("incomplete.json");
        std::fs::write(
            &incomplete,
            serde_json::to_vec(&json!([{"precinct_id": "P1", "priority_score": 40}]))
                .expect("serialize fixture"),
        )
        .expect("write fixture");
        assert!(matches!(
            JsonFileStore::open(&incomplete),
            Err(StoreError::Load(_))
        ));

        remove_temp_path(&dir);
    }

    #[test]
    fn persist_failure_rolls_back_in_memory_state() {
        let dir = unique_temp_dir("persist-failure");
        let path = write_backing_file(&dir, &sample_records());
        let mut store = JsonFileStore::open(&path).expect("open store");

        // Deleting the directory makes the temp-file write fail.
        std::fs::remove_dir_all(&dir).expect("remove backing dir");

        let result = store.update_precinct(
            &PrecinctId::from("P1"),
            &changes(&[("priority_score", json!(75))]),
        );

        assert!(matches!(result, Err(StoreError::Persist(_))));
        assert_eq!(
            store
                .get_precinct(&PrecinctId::from("P1"))
                .expect("lookup")
                .priority_score,
            40
        );
    }

    #[test]
    fn shared_store_updates_are_visible_through_every_handle() {
        let dir = unique_temp_dir("shared");
        let path = write_backing_file(&dir, &sample_records());
        let shared = SharedPrecinctStore::open(&path).expect("open store");
        let other = shared.clone();

        shared
            .update_precinct(
                &PrecinctId::from("P2"),
                &changes(&[("target_households", json!(3000))]),
            )
            .expect("update");

        assert_eq!(
            other
                .get_precinct(&PrecinctId::from("P2"))
                .expect("lookup")
                .target_households,
            3000
        );
        assert_eq!(other.get_all_precincts().len(), 2);

        remove_temp_path(&dir);
    }
}
