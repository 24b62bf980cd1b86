//! Process-wide promise registry
//!
//! Maps the id of every externally-completable live promise to its
//! handle, so code holding only an id can settle it. Entries are added
//! when a promise is launched non-blocking and removed exactly once in
//! `close()`. The shared id generator lives here too; promise
//! construction re-rolls ids that collide with a live entry.

use crate::id::IdGenerator;
use crate::outcome::{Outcome, Payload};
use crate::promise::Promise;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

struct Registry {
    map: Mutex<HashMap<u32, Arc<Promise>>>,
    ids: Mutex<IdGenerator>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        map: Mutex::new(HashMap::new()),
        ids: Mutex::new(IdGenerator::default()),
    })
}

/// Generates an id that is unique among currently-live promises.
///
/// Ids may repeat across non-overlapping lifetimes; only liveness
/// matters here. Default cycle: [`crate::id::DEFAULT_CYCLE`] seconds.
pub(crate) fn next_id() -> u32 {
    let reg = registry();
    loop {
        let id = reg.ids.lock().unwrap().generate();
        if !reg.map.lock().unwrap().contains_key(&id) {
            return id;
        }
    }
}

pub(crate) fn insert(promise: &Arc<Promise>) {
    registry()
        .map
        .lock()
        .unwrap()
        .insert(promise.id(), Arc::clone(promise));
}

pub(crate) fn remove(id: u32) {
    registry().map.lock().unwrap().remove(&id);
}

/// Looks up a live promise by id.
pub fn get(id: u32) -> Option<Arc<Promise>> {
    registry().map.lock().unwrap().get(&id).cloned()
}

/// Resolves a live promise by id with no payload. No-op when the id is
/// absent (already settled or never registered).
pub fn resolve(id: u32) {
    if let Some(promise) = get(id) {
        promise.resolve();
    }
}

/// Resolves a live promise by id with a typed payload. No-op when the
/// id is absent.
pub fn resolve_with<T: Any + Send + Sync>(id: u32, data: T) {
    if let Some(promise) = get(id) {
        promise.resolve_with(data);
    }
}

/// Resolves a live promise by id with an already-wrapped payload.
pub fn resolve_payload(id: u32, data: Option<Payload>) {
    if let Some(promise) = get(id) {
        promise.resolve_payload(data);
    }
}

/// Rejects a live promise by id. No-op when the id is absent.
pub fn reject(id: u32, outcome: Outcome) {
    if let Some(promise) = get(id) {
        promise.reject_with(outcome);
    }
}
