// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Watch-driven object cache.
//!
//! One [`ObjectCache`] exists per resource kind. Reads are served from a
//! local map that a background watch keeps coherent with the API server;
//! mutations go upstream and then block until the local map observes their
//! effect, which gives callers read-your-writes against the cache.
//!
//! Startup performs an explicit list before watching and fails fast if the
//! list fails, so a successfully constructed cache doubles as a readiness
//! check.

use crate::backend::kubernetes::waiter::Waiter;
use crate::constants::SET_RETRY_LIMIT;
use crate::errors::BackendError;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One entry of an RFC 6902 JSON patch document.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct PatchOp {
    op: &'static str,
    path: &'static str,
    value: serde_json::Value,
}

impl PatchOp {
    pub(crate) fn test(path: &'static str, value: serde_json::Value) -> Self {
        Self {
            op: "test",
            path,
            value,
        }
    }

    pub(crate) fn replace(path: &'static str, value: serde_json::Value) -> Self {
        Self {
            op: "replace",
            path,
            value,
        }
    }

    pub(crate) fn add(path: &'static str, value: serde_json::Value) -> Self {
        Self {
            op: "add",
            path,
            value,
        }
    }
}

/// Capabilities a resource kind brings to the cache: naming, a guarded
/// mutation recipe, and a materialization check for submitted changes.
pub(crate) trait WatchedObject:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    /// Kind name used in logs and error attributes.
    const KIND: &'static str;

    /// The name uniquely identifying this object within its namespace.
    fn object_name(&self) -> String {
        self.name_any()
    }

    /// Apply `mutate` to a copy of this object and return the copy together
    /// with a JSON-patch document whose `test` operations guard the mutated
    /// fields' previous values against concurrent writers.
    fn mutated(&self, mutate: &mut (dyn FnMut(&mut Self) + Send)) -> (Self, Vec<PatchOp>);

    /// Whether `observed`, as read back from the cache, already reflects
    /// this (desired) version of the object.
    fn materializes(&self, observed: &Self) -> bool;
}

/// How an object changed, as reported to the change handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Added,
    Updated,
    Deleted,
}

/// Hook invoked under the cache lock on every observed change. Receives the
/// new object (absent for deletes) and the previous one (absent for adds).
pub(crate) type ChangeHandler<K> = Arc<dyn Fn(Change, Option<&K>, Option<&K>) + Send + Sync>;

struct CacheState<K: WatchedObject> {
    namespace: String,
    objects: RwLock<HashMap<String, K>>,
    create_wait: Waiter,
    update_wait: Waiter,
    delete_wait: Waiter,
    change_handler: Option<ChangeHandler<K>>,
}

impl<K: WatchedObject> CacheState<K> {
    fn contains(&self, name: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<K> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Install an observed object version and notify waiters. The change
    /// handler runs while the map lock is held so secondary indexes stay in
    /// step with the map.
    fn apply(&self, object: K) {
        let name = object.object_name();
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let previous = objects.insert(name.clone(), object.clone());
        if let Some(handler) = &self.change_handler {
            match previous.as_ref() {
                Some(old) => handler(Change::Updated, Some(&object), Some(old)),
                None => handler(Change::Added, Some(&object), None),
            }
        }
        drop(objects);
        match previous {
            Some(_) => self.update_wait.submit(&name),
            None => self.create_wait.submit(&name),
        }
    }

    /// Drop an observed object and notify waiters.
    fn remove(&self, name: &str) {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let previous = objects.remove(name);
        if let Some(old) = previous.as_ref() {
            if let Some(handler) = &self.change_handler {
                handler(Change::Deleted, None, Some(old));
            }
        }
        drop(objects);
        self.delete_wait.submit(name);
    }

    /// After a watch restart, drop every object the re-list did not report.
    fn sweep(&self, seen: &HashSet<String>) {
        let stale: Vec<String> = {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            objects
                .keys()
                .filter(|name| !seen.contains(*name))
                .cloned()
                .collect()
        };
        for name in stale {
            debug!(kind = K::KIND, name = %name, "object vanished during watch restart");
            self.remove(&name);
        }
    }
}

/// Cache of one resource kind, kept coherent via a background watch.
pub(crate) struct ObjectCache<K: WatchedObject> {
    api: Api<K>,
    state: Arc<CacheState<K>>,
    shutdown: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K> ObjectCache<K>
where
    K: WatchedObject + Resource<Scope = NamespaceResourceScope>,
{
    /// List the kind once to populate the local map, then start watching.
    pub(crate) async fn new(
        client: Client,
        namespace: &str,
        change_handler: Option<ChangeHandler<K>>,
    ) -> Result<Self, BackendError> {
        let api: Api<K> = Api::namespaced(client, namespace);
        let state = Arc::new(CacheState {
            namespace: namespace.to_string(),
            objects: RwLock::new(HashMap::new()),
            create_wait: Waiter::new(K::KIND, namespace),
            update_wait: Waiter::new(K::KIND, namespace),
            delete_wait: Waiter::new(K::KIND, namespace),
            change_handler,
        });

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|err| BackendError::RequestFailed {
                reason: format!("initial {} list in namespace '{namespace}' failed", K::KIND),
                source: Some(Box::new(err)),
            })?;
        for object in list.items {
            state.apply(object);
        }
        debug!(
            kind = K::KIND,
            namespace = namespace,
            objects = state.objects.read().unwrap_or_else(PoisonError::into_inner).len(),
            "cache primed"
        );

        let shutdown = CancellationToken::new();
        let watch_task = tokio::spawn(run_watch(api.clone(), state.clone(), shutdown.clone()));

        Ok(Self {
            api,
            state,
            shutdown,
            watch_task: Mutex::new(Some(watch_task)),
        })
    }

    /// Read the cached version of an object.
    pub(crate) fn get(&self, name: &str) -> Result<K, BackendError> {
        self.state
            .lookup(name)
            .ok_or_else(|| BackendError::ObjectNotFound {
                kind: K::KIND,
                name: name.to_string(),
                namespace: self.state.namespace.clone(),
            })
    }

    /// Submit a new object and wait until the local map contains it. The
    /// server may assign the final name (`generateName`); the stored object
    /// is returned.
    pub(crate) async fn create(
        &self,
        cancel: &CancellationToken,
        object: &K,
    ) -> Result<K, BackendError> {
        debug!(kind = K::KIND, name = %object.object_name(), "creating object");
        let created = self
            .api
            .create(&PostParams::default(), object)
            .await
            .map_err(|err| self.map_error(&object.object_name(), err))?;
        let name = created.object_name();
        let state = self.state.clone();
        self.state
            .create_wait
            .wait(cancel, &name, || Ok(state.contains(&name)))
            .await?;
        self.get(&name)
    }

    /// Delete an object and wait until the local map no longer contains it.
    /// Deleting an absent object succeeds.
    pub(crate) async fn delete(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<(), BackendError> {
        if !self.state.contains(name) {
            return Ok(());
        }
        debug!(kind = K::KIND, name = %name, "deleting object");
        if let Err(err) = self.api.delete(name, &DeleteParams::default()).await {
            let err = self.map_error(name, err);
            if err.is_not_found() {
                return Ok(());
            }
            return Err(err);
        }
        let state = self.state.clone();
        self.state
            .delete_wait
            .wait(cancel, name, || Ok(!state.contains(name)))
            .await
    }

    /// Optimistically update an object through its patch recipe.
    ///
    /// On a precondition violation (a concurrent writer got there first) the
    /// call waits until the cache observes a different version of the object
    /// and retries, up to [`SET_RETRY_LIMIT`] times.
    pub(crate) async fn set(
        &self,
        cancel: &CancellationToken,
        name: &str,
        mutate: &mut (dyn FnMut(&mut K) + Send),
    ) -> Result<(), BackendError> {
        for _attempt in 0..SET_RETRY_LIMIT {
            let original = self.get(name)?;
            let (next, ops) = original.mutated(mutate);
            let patch = encode_patch(K::KIND, name, &ops)?;

            match self.api.patch(name, &PatchParams::default(), &patch).await {
                Ok(_) => return self.wait_for_update(cancel, &next).await,
                Err(kube::Error::Api(response)) if response.code == 422 => {
                    debug!(
                        kind = K::KIND,
                        name = %name,
                        "patch precondition failed, waiting for a newer version"
                    );
                    self.wait_for_change(cancel, &original).await?;
                }
                Err(err) => return Err(self.map_error(name, err)),
            }
        }
        Err(BackendError::request_failed(format!(
            "exhausted retries while trying to update {} '{name}'",
            K::KIND
        )))
    }

    /// Stop the watch and wait for its task to exit.
    pub(crate) async fn close(&self) {
        debug!(kind = K::KIND, "closing object cache");
        self.shutdown.cancel();
        let task = self
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Wait until the cache holds a version that reflects `desired`.
    async fn wait_for_update(
        &self,
        cancel: &CancellationToken,
        desired: &K,
    ) -> Result<(), BackendError> {
        let name = desired.object_name();
        let state = self.state.clone();
        self.state
            .update_wait
            .wait(cancel, &name, || match state.lookup(&name) {
                Some(current) => Ok(desired.materializes(&current)),
                None => Err(BackendError::request_failed(format!(
                    "{} '{name}' deleted while waiting for update",
                    K::KIND
                ))),
            })
            .await
    }

    /// Wait until the cache holds any version other than `original`.
    async fn wait_for_change(
        &self,
        cancel: &CancellationToken,
        original: &K,
    ) -> Result<(), BackendError> {
        let name = original.object_name();
        let version = original.meta().resource_version.clone();
        let state = self.state.clone();
        self.state
            .update_wait
            .wait(cancel, &name, || match state.lookup(&name) {
                Some(current) => Ok(current.meta().resource_version != version),
                None => Err(BackendError::request_failed(format!(
                    "{} '{name}' deleted while waiting for a newer version",
                    K::KIND
                ))),
            })
            .await
    }

    fn map_error(&self, name: &str, err: kube::Error) -> BackendError {
        match err {
            kube::Error::Api(response) if response.code == 404 => BackendError::ObjectNotFound {
                kind: K::KIND,
                name: name.to_string(),
                namespace: self.state.namespace.clone(),
            },
            kube::Error::Api(response) if response.code == 409 => BackendError::Conflict {
                kind: K::KIND,
                name: name.to_string(),
            },
            err => BackendError::RequestFailed {
                reason: format!(
                    "{} '{name}' request in namespace '{}' failed",
                    K::KIND,
                    self.state.namespace
                ),
                source: Some(Box::new(err)),
            },
        }
    }
}

fn encode_patch(
    kind: &'static str,
    name: &str,
    ops: &[PatchOp],
) -> Result<Patch<()>, BackendError> {
    let value = serde_json::to_value(ops).map_err(|err| BackendError::RequestFailed {
        reason: format!("cannot encode patch for {kind} '{name}'"),
        source: Some(Box::new(err)),
    })?;
    let document = serde_json::from_value(value).map_err(|err| BackendError::RequestFailed {
        reason: format!("cannot encode patch for {kind} '{name}'"),
        source: Some(Box::new(err)),
    })?;
    Ok(Patch::Json(document))
}

/// Consume the watch stream until shutdown. The stream's own list phase is
/// replayed into the map; objects missing after a restart are swept out.
async fn run_watch<K>(api: Api<K>, state: Arc<CacheState<K>>, shutdown: CancellationToken)
where
    K: WatchedObject,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut resync: Option<HashSet<String>> = None;

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            Ok(watcher::Event::Init) => {
                resync = Some(HashSet::new());
            }
            Ok(watcher::Event::InitApply(object)) => {
                if let Some(seen) = resync.as_mut() {
                    seen.insert(object.object_name());
                }
                state.apply(object);
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(seen) = resync.take() {
                    state.sweep(&seen);
                }
            }
            Ok(watcher::Event::Apply(object)) => {
                debug!(kind = K::KIND, name = %object.object_name(), "watch reports object applied");
                state.apply(object);
            }
            Ok(watcher::Event::Delete(object)) => {
                debug!(kind = K::KIND, name = %object.object_name(), "watch reports object deleted");
                state.remove(&object.object_name());
            }
            Err(err) => {
                warn!(kind = K::KIND, error = %err, "watch stream error, backing off");
            }
        }
    }
}
