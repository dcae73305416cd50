use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::api::Preconditions;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{
    ClientError, ClusterClient, ClusterResource, DeleteOutcome, labels_match, object_key,
};

/// kind, namespace, name
type ObjectId = (String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Patch,
    Delete,
    UpdateStatus,
}

/// A successful write recorded by [`InMemoryClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Failure returned by the next writes against a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectId, Value>,
    resource_version: u64,
    mutations: Vec<Mutation>,
    faults: BTreeMap<String, VecDeque<Fault>>,
}

/// In-process model of the API server's object semantics.
///
/// Tracks `resourceVersion` (optimistic concurrency), `generation` (bumped on
/// spec changes), `uid`, `creationTimestamp`, finalizers with
/// `deletionTimestamp`, and background garbage collection through controller
/// owner references. Status is only writable through `update_status`.
#[derive(Default)]
pub struct InMemoryClient {
    state: Mutex<State>,
}

fn kind_of<K: ClusterResource>() -> String {
    K::kind(&()).to_string()
}

fn meta_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get("metadata")?.get(field)
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    meta_field(value, field)?.as_str()
}

fn set_meta_field(value: &mut Value, field: &str, new: Option<Value>) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    let metadata = map.entry("metadata").or_insert_with(|| json!({}));
    if let Some(metadata) = metadata.as_object_mut() {
        match new {
            Some(v) => {
                metadata.insert(field.to_string(), v);
            }
            None => {
                metadata.remove(field);
            }
        }
    }
}

fn has_finalizers(value: &Value) -> bool {
    meta_field(value, "finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn owned_by(value: &Value, uid: &str) -> bool {
    meta_field(value, "ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_fault(&mut self, kind: &str, key: &str) -> Result<(), ClientError> {
        let Some(fault) = self.faults.get_mut(kind).and_then(VecDeque::pop_front) else {
            return Ok(());
        };
        Err(match fault {
            Fault::Conflict => ClientError::Conflict {
                kind: kind.to_string(),
                key: key.to_string(),
                message: "injected conflict".to_string(),
            },
            Fault::Unavailable => ClientError::Api {
                code: 503,
                message: "injected unavailability".to_string(),
            },
        })
    }

    fn record(&mut self, verb: Verb, id: &ObjectId) {
        self.mutations.push(Mutation {
            verb,
            kind: id.0.clone(),
            namespace: id.1.clone(),
            name: id.2.clone(),
        });
    }

    /// Store `value` as the next revision of `id`, returning what was stored
    fn commit(&mut self, id: &ObjectId, previous: Option<&Value>, mut value: Value) -> Value {
        let generation = match previous {
            None => 1,
            Some(prev) => {
                let prev_generation = meta_field(prev, "generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                if prev.get("spec") != value.get("spec") {
                    prev_generation + 1
                } else {
                    prev_generation
                }
            }
        };
        set_meta_field(&mut value, "generation", Some(json!(generation)));
        let rv = self.next_resource_version();
        set_meta_field(&mut value, "resourceVersion", Some(json!(rv)));

        if meta_field(&value, "deletionTimestamp").is_some() && !has_finalizers(&value) {
            self.remove(id);
        } else {
            self.objects.insert(id.clone(), value.clone());
        }
        value
    }

    /// Delete `id` now, then collect its dependents
    fn remove(&mut self, id: &ObjectId) {
        let mut pending: VecDeque<ObjectId> = VecDeque::from([id.clone()]);
        while let Some(current) = pending.pop_front() {
            let Some(removed) = self.objects.remove(&current) else {
                continue;
            };
            let Some(uid) = meta_str(&removed, "uid").map(str::to_string) else {
                continue;
            };
            let dependents: Vec<ObjectId> = self
                .objects
                .iter()
                .filter(|((_, ns, _), v)| *ns == current.1 && owned_by(v, &uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dependent in dependents {
                let has_finalizers = self.objects.get(&dependent).is_some_and(has_finalizers);
                if has_finalizers {
                    let rv = self.next_resource_version();
                    if let Some(obj) = self.objects.get_mut(&dependent) {
                        if meta_field(obj, "deletionTimestamp").is_none() {
                            set_meta_field(obj, "deletionTimestamp", Some(json!(now())));
                        }
                        set_meta_field(obj, "resourceVersion", Some(json!(rv)));
                    }
                } else {
                    pending.push_back(dependent);
                }
            }
        }
    }

    fn check_resource_version(
        id: &ObjectId,
        stored: &Value,
        requested: Option<&str>,
    ) -> Result<(), ClientError> {
        match requested {
            Some(rv) if Some(rv) != meta_str(stored, "resourceVersion") => {
                Err(ClientError::Conflict {
                    kind: id.0.clone(),
                    key: format!("{}/{}", id.1, id.2),
                    message: format!("resourceVersion {} is stale", rv),
                })
            }
            _ => Ok(()),
        }
    }
}

fn not_found(id: &ObjectId) -> ClientError {
    ClientError::NotFound {
        kind: id.0.clone(),
        key: format!("{}/{}", id.1, id.2),
    }
}

fn identify<K: ClusterResource>(obj: &K) -> Result<ObjectId, ClientError> {
    let kind = kind_of::<K>();
    let meta = obj.meta();
    match (&meta.namespace, &meta.name) {
        (Some(ns), Some(name)) => Ok((kind, ns.clone(), name.clone())),
        _ => Err(ClientError::Invalid {
            kind,
            key: object_key(obj),
            message: "namespace and name are required".to_string(),
        }),
    }
}

/// Deserialize a stored value, reporting schema mismatches as `Invalid`
fn decode<K: ClusterResource>(id: &ObjectId, value: Value) -> Result<K, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Invalid {
        kind: id.0.clone(),
        key: format!("{}/{}", id.1, id.2),
        message: e.to_string(),
    })
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object as-is, status included, filling in server fields
    /// that are missing. Replaces any existing object with the same key.
    pub async fn seed<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let id = identify(obj)?;
        let mut value = serde_json::to_value(obj)?;
        if meta_str(&value, "uid").is_none() {
            set_meta_field(&mut value, "uid", Some(json!(uuid::Uuid::new_v4().to_string())));
        }
        if meta_field(&value, "creationTimestamp").is_none() {
            set_meta_field(&mut value, "creationTimestamp", Some(json!(now())));
        }
        let mut state = self.state.lock().await;
        let stored = state.commit(&id, None, value);
        decode(&id, stored)
    }

    /// Fail the next `times` writes against `kind` with `fault`
    pub async fn inject_fault(&self, kind: &str, fault: Fault, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.faults.entry(kind.to_string()).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    pub async fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().await.mutations.clone()
    }

    pub async fn clear_mutations(&self) {
        self.state.lock().await.mutations.clear();
    }

    /// Writes recorded against one object
    pub async fn mutations_for(&self, kind: &str, namespace: &str, name: &str) -> Vec<Mutation> {
        self.state
            .lock()
            .await
            .mutations
            .iter()
            .filter(|m| m.kind == kind && m.namespace == namespace && m.name == name)
            .cloned()
            .collect()
    }

    /// Number of stored objects of kind `K` in `namespace`
    pub async fn count<K: ClusterResource>(&self, namespace: &str) -> usize {
        let kind = kind_of::<K>();
        self.state
            .lock()
            .await
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }
}

#[async_trait]
impl ClusterClient for InMemoryClient {
    async fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClientError> {
        let id = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let stored = self.state.lock().await.objects.get(&id).cloned();
        stored.map(|v| decode(&id, v)).transpose()
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError> {
        let kind = kind_of::<K>();
        let state = self.state.lock().await;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, v)| {
                let labels: Option<BTreeMap<String, String>> = meta_field(v, "labels")
                    .and_then(|l| serde_json::from_value(l.clone()).ok());
                labels_match(labels.as_ref(), selector)
            })
            .map(|(id, v)| decode(id, v.clone()))
            .collect()
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let id = identify(obj)?;
        let mut state = self.state.lock().await;
        state.take_fault(&id.0, &object_key(obj))?;
        if state.objects.contains_key(&id) {
            return Err(ClientError::AlreadyExists {
                kind: id.0.clone(),
                key: object_key(obj),
            });
        }
        if obj.meta().resource_version.is_some() {
            return Err(ClientError::Invalid {
                kind: id.0.clone(),
                key: object_key(obj),
                message: "resourceVersion should not be set on objects to be created".to_string(),
            });
        }

        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        set_meta_field(&mut value, "uid", Some(json!(uuid::Uuid::new_v4().to_string())));
        set_meta_field(&mut value, "creationTimestamp", Some(json!(now())));
        set_meta_field(&mut value, "deletionTimestamp", None);

        let stored = state.commit(&id, None, value);
        state.record(Verb::Create, &id);
        decode(&id, stored)
    }

    async fn update<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let id = identify(obj)?;
        let mut state = self.state.lock().await;
        state.take_fault(&id.0, &object_key(obj))?;
        let stored = state.objects.get(&id).cloned().ok_or_else(|| not_found(&id))?;
        State::check_resource_version(&id, &stored, obj.meta().resource_version.as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            set_meta_field(&mut value, field, meta_field(&stored, field).cloned());
        }
        if let Some(map) = value.as_object_mut() {
            match stored.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }

        let committed = state.commit(&id, Some(&stored), value);
        state.record(Verb::Update, &id);
        decode(&id, committed)
    }

    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClientError> {
        let id = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut state = self.state.lock().await;
        state.take_fault(&id.0, &format!("{namespace}/{name}"))?;
        let stored = state.objects.get(&id).cloned().ok_or_else(|| not_found(&id))?;
        State::check_resource_version(
            &id,
            &stored,
            patch
                .get("metadata")
                .and_then(|m| m.get("resourceVersion"))
                .and_then(Value::as_str),
        )?;

        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let mut value = stored.clone();
        json_patch::merge(&mut value, &patch);
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            set_meta_field(&mut value, field, meta_field(&stored, field).cloned());
        }
        // Reject patches that break the object's schema before storing them.
        decode::<K>(&id, value.clone())?;

        let committed = state.commit(&id, Some(&stored), value);
        state.record(Verb::Patch, &id);
        decode(&id, committed)
    }

    async fn delete<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> Result<DeleteOutcome, ClientError> {
        let id = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut state = self.state.lock().await;
        state.take_fault(&id.0, &format!("{namespace}/{name}"))?;
        let stored = state.objects.get(&id).cloned().ok_or_else(|| not_found(&id))?;

        if let Some(pre) = preconditions {
            if let Some(uid) = pre.uid.as_deref()
                && Some(uid) != meta_str(&stored, "uid")
            {
                return Err(ClientError::Conflict {
                    kind: id.0.clone(),
                    key: format!("{namespace}/{name}"),
                    message: format!("precondition failed: uid {} does not match", uid),
                });
            }
            State::check_resource_version(&id, &stored, pre.resource_version.as_deref())?;
        }

        state.record(Verb::Delete, &id);
        if has_finalizers(&stored) {
            if meta_field(&stored, "deletionTimestamp").is_none() {
                let mut value = stored.clone();
                set_meta_field(&mut value, "deletionTimestamp", Some(json!(now())));
                state.commit(&id, Some(&stored), value);
            }
            return Ok(DeleteOutcome::Pending);
        }
        state.remove(&id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn update_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let id = identify(obj)?;
        let mut state = self.state.lock().await;
        state.take_fault(&id.0, &object_key(obj))?;
        let stored = state.objects.get(&id).cloned().ok_or_else(|| not_found(&id))?;
        State::check_resource_version(&id, &stored, obj.meta().resource_version.as_deref())?;

        let incoming = serde_json::to_value(obj)?;
        let mut value = stored.clone();
        if let Some(map) = value.as_object_mut() {
            match incoming.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }

        let committed = state.commit(&id, Some(&stored), value);
        state.record(Verb::UpdateStatus, &id);
        decode(&id, committed)
    }
}
