use crate::api::DeviceRequestAllocationResult;
use std::{
  collections::{HashMap, HashSet},
  sync::Mutex,
};

/// What the store keeps per claim: identity, the pods it is reserved for,
/// and the allocation results owned by this driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
  pub uid: String,
  pub namespace: String,
  pub name: String,
  pub pod_uids: Vec<String>,
  pub results: Vec<DeviceRequestAllocationResult>,
}

impl ClaimRecord {
  pub fn namespaced_name(&self) -> String {
    format!("{}/{}", self.namespace, self.name)
  }
}

#[derive(Debug, Default)]
struct Indexes {
  /// `<namespace>/<name>` -> record.
  by_namespaced_name: HashMap<String, ClaimRecord>,
  /// pod UID -> namespaced names of claims reserved for it.
  by_pod_uid: HashMap<String, HashSet<String>>,
}

/// Indexed cache of the claims this node has prepared. The primary index is
/// the namespaced name; a secondary index maps every pod in `reservedFor` to
/// its claims.
#[derive(Debug, Default)]
pub struct ClaimStore {
  inner: Mutex<Indexes>,
}

impl ClaimStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts or replaces a record, keeping the pod index consistent.
  pub fn insert(&self, record: ClaimRecord) {
    let key = record.namespaced_name();
    let mut inner = self.inner.lock().unwrap();

    if let Some(previous) = inner.by_namespaced_name.remove(&key) {
      Self::unindex_pods(&mut inner, &previous);
    }

    for pod_uid in &record.pod_uids {
      inner
        .by_pod_uid
        .entry(pod_uid.clone())
        .or_default()
        .insert(key.clone());
    }

    inner.by_namespaced_name.insert(key, record);
  }

  /// Removes a claim by `<namespace>/<name>`. Absent claims are fine.
  pub fn remove(&self, namespaced_name: &str) -> Option<ClaimRecord> {
    let mut inner = self.inner.lock().unwrap();
    let record = inner.by_namespaced_name.remove(namespaced_name)?;
    Self::unindex_pods(&mut inner, &record);
    Some(record)
  }

  pub fn get(&self, namespaced_name: &str) -> Option<ClaimRecord> {
    self
      .inner
      .lock()
      .unwrap()
      .by_namespaced_name
      .get(namespaced_name)
      .cloned()
  }

  /// All claims reserved for the given pod.
  pub fn get_by_pod_uid(&self, pod_uid: &str) -> Vec<ClaimRecord> {
    let inner = self.inner.lock().unwrap();
    let mut records: Vec<ClaimRecord> = inner
      .by_pod_uid
      .get(pod_uid)
      .map(|keys| {
        keys
          .iter()
          .filter_map(|key| inner.by_namespaced_name.get(key).cloned())
          .collect()
      })
      .unwrap_or_default();

    records.sort_by(|a, b| a.namespaced_name().cmp(&b.namespaced_name()));
    records
  }

  fn unindex_pods(inner: &mut Indexes, record: &ClaimRecord) {
    let key = record.namespaced_name();
    for pod_uid in &record.pod_uids {
      if let Some(keys) = inner.by_pod_uid.get_mut(pod_uid) {
        keys.remove(&key);
        if keys.is_empty() {
          inner.by_pod_uid.remove(pod_uid);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(namespace: &str, name: &str, pods: &[&str]) -> ClaimRecord {
    ClaimRecord {
      uid: format!("uid-{}-{}", namespace, name),
      namespace: namespace.to_string(),
      name: name.to_string(),
      pod_uids: pods.iter().map(|p| p.to_string()).collect(),
      results: Vec::new(),
    }
  }

  #[test]
  fn insert_and_lookup_by_both_indexes() {
    let store = ClaimStore::new();
    store.insert(record("team-a", "nic", &["pod-1", "pod-2"]));
    store.insert(record("team-b", "nic", &["pod-2"]));

    assert!(store.get("team-a/nic").is_some());
    assert_eq!(store.get_by_pod_uid("pod-1").len(), 1);
    assert_eq!(store.get_by_pod_uid("pod-2").len(), 2);
    assert!(store.get_by_pod_uid("pod-3").is_empty());
  }

  #[test]
  fn remove_is_idempotent_and_cleans_pod_index() {
    let store = ClaimStore::new();
    store.insert(record("team-a", "nic", &["pod-1"]));

    assert!(store.remove("team-a/nic").is_some());
    assert!(store.remove("team-a/nic").is_none());
    assert!(store.get_by_pod_uid("pod-1").is_empty());
  }

  #[test]
  fn reinsert_replaces_pod_reservations() {
    let store = ClaimStore::new();
    store.insert(record("team-a", "nic", &["pod-1"]));
    store.insert(record("team-a", "nic", &["pod-2"]));

    assert!(store.get_by_pod_uid("pod-1").is_empty());
    assert_eq!(store.get_by_pod_uid("pod-2").len(), 1);
  }
}
