//! A list-then-watch cache of a single namespaced cluster resource kind.
//!
//! Maintains `name -> object` with resync-from-list and watch-from-resourceVersion
//! semantics: a full list seeds the cache and a resourceVersion cursor, a long-lived watch
//! session applies incremental events, and a "resource version too old" signal (HTTP 410)
//! discards the cursor and forces a fresh list.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use kube::api::{Api, ListParams, WatchEvent};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// A single cached object: the resourceVersion is stored alongside it since it becomes the
/// watch cursor after any event touching this object.
#[derive(Debug, Clone)]
struct CachedObject<T> {
    object: T,
    resource_version: String,
}

struct CacheState<T> {
    objects: HashMap<String, CachedObject<T>>,
    synced: bool,
}

impl<T> Default for CacheState<T> {
    fn default() -> Self {
        Self { objects: HashMap::new(), synced: false }
    }
}

/// An eventually-consistent local cache of one namespaced resource kind, maintained by a
/// background task. Reads are lock-protected; a full resync builds the new map off-lock and
/// swaps it in under the lock, so readers are never blocked by a resync in progress.
pub struct WorkloadInformer<T> {
    state: Arc<RwLock<CacheState<T>>>,
    stop: CancellationToken,
}

impl<T> WorkloadInformer<T>
where
    T: Clone + Resource + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static,
{
    /// Start the background list-then-watch task against `api`. `watch_timeout` bounds each
    /// watch session (step 3 of the protocol); when `watch_timeout` is `None`, the informer
    /// runs in degraded mode and performs periodic full resyncs at `resync_period` instead.
    pub fn spawn(api: Api<T>, watch_timeout: Option<Duration>, resync_period: Duration) -> Self {
        let state: Arc<RwLock<CacheState<T>>> = Arc::new(RwLock::new(CacheState::default()));
        let stop = CancellationToken::new();

        let task_state = state.clone();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            run_informer_loop(api, task_state, task_stop, watch_timeout, resync_period).await;
        });

        Self { state, stop }
    }

    /// Request shutdown of the background task. Deterministic: the task observes the
    /// cancellation at its next suspension point and exits without further runtime calls.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Whether the initial list has completed at least once since the last "gone" reset.
    pub fn is_synced(&self) -> bool {
        self.state.read().expect("lock poisoned").synced
    }

    /// Read a single object by name from the cache.
    pub fn get(&self, name: &str) -> Option<T> {
        self.state.read().expect("lock poisoned").objects.get(name).map(|c| c.object.clone())
    }

    /// Read every cached object. Copies the values out under the lock; the caller operates
    /// on the copy lock-free.
    pub fn list(&self) -> Vec<T> {
        self.state.read().expect("lock poisoned").objects.values().map(|c| c.object.clone()).collect()
    }
}

async fn run_informer_loop<T>(
    api: Api<T>,
    state: Arc<RwLock<CacheState<T>>>,
    stop: CancellationToken,
    watch_timeout: Option<Duration>,
    resync_period: Duration,
) where
    T: Clone + Resource + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static,
{
    let mut backoff = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    'outer: loop {
        if stop.is_cancelled() {
            return;
        }

        let resource_version = match do_list(&api, &state).await {
            Ok(rv) => {
                backoff = Duration::from_millis(500);
                rv
            }
            Err(err) => {
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis(), "informer list failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue 'outer;
            }
        };

        {
            let mut guard = state.write().expect("lock poisoned");
            guard.synced = true;
        }
        tracing::debug!("informer synced");

        let Some(watch_timeout) = watch_timeout else {
            tokio::select! {
                _ = tokio::time::sleep(resync_period) => continue 'outer,
                _ = stop.cancelled() => return,
            }
        };

        let mut cursor = resource_version;
        loop {
            if stop.is_cancelled() {
                return;
            }

            let params = ListParams::default().timeout(watch_timeout.as_secs() as u32).allow_bookmarks();
            let mut stream = match api.watch(&params, &cursor).await {
                Ok(stream) => Box::pin(stream),
                Err(err) => {
                    if is_expired_resource_version(&err) {
                        tracing::info!("informer watch cursor expired, resetting to full list");
                        let mut guard = state.write().expect("lock poisoned");
                        guard.synced = false;
                        continue 'outer;
                    }
                    tracing::warn!(error = %err, backoff_ms = backoff.as_millis(), "informer watch failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'outer;
                }
            };

            backoff = Duration::from_millis(500);

            use futures::StreamExt;
            loop {
                tokio::select! {
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => match apply_event(&state, event) {
                                EventOutcome::Cursor(new_cursor) => cursor = new_cursor,
                                EventOutcome::NoChange => {}
                                EventOutcome::Expired => {
                                    tracing::info!("informer watch stream reported resource version expired, resetting to full list");
                                    let mut guard = state.write().expect("lock poisoned");
                                    guard.synced = false;
                                    continue 'outer;
                                }
                            },
                            Some(Err(err)) => {
                                if is_expired_resource_version(&err) {
                                    let mut guard = state.write().expect("lock poisoned");
                                    guard.synced = false;
                                    continue 'outer;
                                }
                                tracing::warn!(error = %err, "informer watch stream error");
                                continue 'outer;
                            }
                            None => {
                                // Watch session timed out; loop back to step 3 with the latest cursor.
                                continue 'outer;
                            }
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        }
    }
}

async fn do_list<T>(api: &Api<T>, state: &Arc<RwLock<CacheState<T>>>) -> kube::Result<String>
where
    T: Clone + Resource + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static,
{
    let list = api.list(&ListParams::default()).await?;
    let resource_version = list.metadata.resource_version.clone().unwrap_or_default();

    let mut fresh = HashMap::new();
    for item in list.items {
        let name = item.meta().name.clone().unwrap_or_default();
        let rv = item.meta().resource_version.clone().unwrap_or_default();
        fresh.insert(name, CachedObject { object: item, resource_version: rv });
    }

    // Built off-lock above; swap in under the lock so readers never see a half-built map.
    let mut guard = state.write().expect("lock poisoned");
    guard.objects = fresh;
    Ok(resource_version)
}

/// Result of folding one watch event into the cache.
enum EventOutcome {
    /// The cache changed; the cursor should advance to this resourceVersion.
    Cursor(String),
    /// Nothing for the caller to act on.
    NoChange,
    /// The apiserver reported the watch's resourceVersion as gone (HTTP 410); the caller must
    /// discard the cursor and relist.
    Expired,
}

fn apply_event<T>(state: &Arc<RwLock<CacheState<T>>>, event: WatchEvent<T>) -> EventOutcome
where
    T: Clone + Resource + std::fmt::Debug,
{
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            let name = obj.meta().name.clone().unwrap_or_default();
            let rv = obj.meta().resource_version.clone().unwrap_or_default();
            let mut guard = state.write().expect("lock poisoned");
            guard.objects.insert(name, CachedObject { object: obj, resource_version: rv.clone() });
            EventOutcome::Cursor(rv)
        }
        WatchEvent::Deleted(obj) => {
            let name = obj.meta().name.clone().unwrap_or_default();
            let rv = obj.meta().resource_version.clone();
            let mut guard = state.write().expect("lock poisoned");
            guard.objects.remove(&name);
            rv.map(EventOutcome::Cursor).unwrap_or(EventOutcome::NoChange)
        }
        WatchEvent::Bookmark(bookmark) => EventOutcome::Cursor(bookmark.metadata.resource_version),
        WatchEvent::Error(status) => {
            if status.code == 410 || status.reason == "Expired" || status.reason == "Gone" {
                EventOutcome::Expired
            } else {
                tracing::warn!(?status, "informer received error event");
                EventOutcome::NoChange
            }
        }
    }
}

fn is_expired_resource_version(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(api_err) => api_err.code == 410 || api_err.reason == "Expired" || api_err.reason == "Gone",
        _ => false,
    }
}
