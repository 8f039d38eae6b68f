//! Named, shared model handles.
//!
//! A [`ModelRegistry`] loads each named model once and hands out
//! [`Arc`]s to every session that asks for it. Loading is one-writer /
//! many-waiters: the first caller runs the loader, later callers for the
//! same name wait for it to finish.
//!
//! | Situation | Waiters see |
//! |-----------|-------------|
//! | Load succeeds | `Ok(Arc<M>)` |
//! | Load fails | [`RegistryError::LoadFailed`] |
//! | Loader dropped mid-load | [`RegistryError::LoadFailed`] |
//! | [`shutdown`](ModelRegistry::shutdown) | [`RegistryError::Shutdown`] |
//!
//! After shutdown no new loads or lookups start, and a load that completes
//! afterwards is discarded. The registry is an ordinary value: create one,
//! share it behind an `Arc`, and shut it down explicitly.

use crate::error::{RegistryError, RegistryResult};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

enum LoadState<M> {
    Pending,
    Ready(Arc<M>),
    Failed(String),
    Shutdown,
}

impl<M> Clone for LoadState<M> {
    fn clone(&self) -> Self {
        match self {
            LoadState::Pending => LoadState::Pending,
            LoadState::Ready(model) => LoadState::Ready(Arc::clone(model)),
            LoadState::Failed(reason) => LoadState::Failed(reason.clone()),
            LoadState::Shutdown => LoadState::Shutdown,
        }
    }
}

enum Slot<M> {
    Loading(watch::Receiver<LoadState<M>>),
    Ready(Arc<M>),
}

enum Claim<M> {
    Ready(Arc<M>),
    Wait(watch::Receiver<LoadState<M>>),
    Load(watch::Sender<LoadState<M>>),
}

struct Inner<M> {
    slots: HashMap<String, Slot<M>>,
    shutdown: bool,
}

/// Loads named models once and shares them.
pub struct ModelRegistry<M> {
    inner: Mutex<Inner<M>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<M> ModelRegistry<M> {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                shutdown: false,
            }),
            shutdown_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the model called `name`, running `loader` if nobody has
    /// loaded it yet. Concurrent callers for the same name share one load.
    pub async fn load<F, Fut, E>(&self, name: &str, loader: F) -> RegistryResult<Arc<M>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        let claim = {
            let mut inner = self.lock();
            if inner.shutdown {
                return Err(RegistryError::Shutdown(name.to_string()));
            }
            let existing = match inner.slots.get(name) {
                Some(Slot::Ready(model)) => Some(Claim::Ready(Arc::clone(model))),
                // A closed channel means the loader was dropped; start over.
                Some(Slot::Loading(rx)) if rx.has_changed().is_ok() => {
                    Some(Claim::Wait(rx.clone()))
                }
                _ => None,
            };
            match existing {
                Some(claim) => claim,
                None => {
                    let (tx, rx) = watch::channel(LoadState::Pending);
                    inner.slots.insert(name.to_string(), Slot::Loading(rx));
                    Claim::Load(tx)
                }
            }
        };

        let tx = match claim {
            Claim::Ready(model) => return Ok(model),
            Claim::Wait(rx) => {
                debug!("Waiting for model '{name}' to finish loading");
                return self.wait(name, rx).await;
            }
            Claim::Load(tx) => tx,
        };

        info!("Loading model '{name}'");
        let result = loader().await;

        let mut inner = self.lock();
        if inner.shutdown {
            inner.slots.remove(name);
            tx.send_replace(LoadState::Shutdown);
            warn!("Model '{name}' finished loading after shutdown, discarding it");
            return Err(RegistryError::Shutdown(name.to_string()));
        }
        match result {
            Ok(model) => {
                let model = Arc::new(model);
                inner
                    .slots
                    .insert(name.to_string(), Slot::Ready(Arc::clone(&model)));
                tx.send_replace(LoadState::Ready(Arc::clone(&model)));
                info!("Model '{name}' loaded");
                Ok(model)
            }
            Err(e) => {
                inner.slots.remove(name);
                let reason = e.to_string();
                tx.send_replace(LoadState::Failed(reason.clone()));
                warn!("Model '{name}' failed to load: {reason}");
                Err(RegistryError::LoadFailed {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Return an already loaded model, waiting if it is still loading.
    pub async fn get(&self, name: &str) -> RegistryResult<Arc<M>> {
        let rx = {
            let inner = self.lock();
            if inner.shutdown {
                return Err(RegistryError::Shutdown(name.to_string()));
            }
            match inner.slots.get(name) {
                Some(Slot::Ready(model)) => return Ok(Arc::clone(model)),
                Some(Slot::Loading(rx)) if rx.has_changed().is_ok() => rx.clone(),
                _ => return Err(RegistryError::NotFound(name.to_string())),
            }
        };
        self.wait(name, rx).await
    }

    async fn wait(
        &self,
        name: &str,
        mut rx: watch::Receiver<LoadState<M>>,
    ) -> RegistryResult<Arc<M>> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let state = tokio::select! {
            done = rx.wait_for(|s| !matches!(s, LoadState::Pending)) => match done {
                Ok(state) => state.clone(),
                Err(_) => LoadState::Failed("loader dropped before finishing".into()),
            },
            _ = shutdown.wait_for(|down| *down) => LoadState::Shutdown,
        };
        match state {
            LoadState::Ready(model) => Ok(model),
            LoadState::Failed(reason) => Err(RegistryError::LoadFailed {
                name: name.to_string(),
                reason,
            }),
            LoadState::Shutdown | LoadState::Pending => {
                Err(RegistryError::Shutdown(name.to_string()))
            }
        }
    }

    /// Drop the registry's handle to a loaded model. Sessions holding an
    /// `Arc` keep it alive. Returns `false` if it was not loaded.
    pub fn unload(&self, name: &str) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.slots.get(name), Some(Slot::Ready(_))) {
            return false;
        }
        inner.slots.remove(name);
        info!("Model '{name}' unloaded");
        true
    }

    /// Refuse new work, wake every waiter with a shutdown error, and release
    /// all loaded models. Idempotent.
    pub fn shutdown(&self) {
        let released = {
            let mut inner = self.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            let before = inner.slots.len();
            inner.slots.retain(|_, slot| matches!(slot, Slot::Loading(_)));
            before - inner.slots.len()
        };
        self.shutdown_tx.send_replace(true);
        info!("Model registry shut down, released {released} model(s)");
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn is_loading(&self, name: &str) -> bool {
        matches!(self.lock().slots.get(name), Some(Slot::Loading(rx)) if rx.has_changed().is_ok())
    }

    /// Names of loaded models, sorted.
    pub fn loaded(&self) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl<M> Default for ModelRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}
