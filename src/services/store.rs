//! Observable state container.
//!
//! Every mutation goes through [`Store::update`]: the new snapshot is merged,
//! written through to session storage, then handed to every listener. The
//! snapshot lock covers only the read-modify-write. Storage writes happen under
//! a separate writer lock taken before the snapshot lock is released, so they
//! land in mutation order. Listeners run with no lock held and may mutate the
//! store again.
//!
//! Jobs whose image has no encoded form yet get encoded in the background
//! whenever a mutation happens inside a Tokio runtime, so a reload can always
//! restore them. `add_to_queue` additionally awaits that stage.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::WidgetConfig;
use crate::models::job::{Job, JobId, JobUpdate};
use crate::models::state::{AppSnapshot, ModalState, PersistedState, StatePatch};
use crate::services::codec;
use crate::services::session_store::{SessionStorage, StorageError};

pub const STATE_KEY: &str = "ai_furniture_widget_state";
pub const MODAL_STATE_KEY: &str = "ai_furniture_modal_state";
pub const SESSION_ID_KEY: &str = "ai_furniture_session_id";

type Listener = Arc<dyn Fn(&Arc<AppSnapshot>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`Store::subscribe`]. Dropping it removes the listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct Store {
    this: Weak<Store>,
    state: Mutex<Arc<AppSnapshot>>,
    storage: Arc<dyn SessionStorage>,
    /// Serializes storage writes; `true` once the session has ended.
    writer: Mutex<bool>,
    listeners: Arc<Mutex<Listeners>>,
    encoding: AtomicBool,
}

impl Store {
    /// Build the store, hydrating from whatever the session already holds.
    pub fn new(storage: Arc<dyn SessionStorage>, config: WidgetConfig) -> Arc<Self> {
        let mut state = AppSnapshot::initial(config);

        if let Some(persisted) = load_persisted(storage.as_ref()) {
            state.queue = persisted.queue.into_iter().map(restore_image).collect();
            state.generated_images = persisted.generated_images;
            state.selected_model = persisted.selected_model;
            state.queue_tab = persisted.queue_tab;
        }
        if let Some(modal) = load_modal_state(storage.as_ref()) {
            state.is_open = modal.is_open;
            state.view = modal.view;
        }
        state.session_id = Some(load_or_create_session_id(storage.as_ref()));

        let summary = state.summary();
        tracing::info!(
            session_id = state.session_id.as_deref().unwrap_or_default(),
            pending = summary.pending,
            processing = summary.processing,
            completed = summary.completed,
            failed = summary.failed,
            "Widget state initialized"
        );

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(Arc::new(state)),
            storage,
            writer: Mutex::new(false),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            encoding: AtomicBool::new(false),
        })
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<AppSnapshot> {
        Arc::clone(&self.state.lock())
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.state().job(id).cloned()
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Shallow-merge `patch`, persist, notify.
    pub fn set_state(&self, patch: StatePatch) -> Arc<AppSnapshot> {
        self.update(|_| Some(patch))
    }

    /// Atomic read-modify-write. `f` returns `None` to leave the state untouched,
    /// in which case nothing is persisted and no listener runs.
    ///
    /// `f` runs under the store lock and must not call back into the store.
    pub fn update<F>(&self, f: F) -> Arc<AppSnapshot>
    where
        F: FnOnce(&AppSnapshot) -> Option<StatePatch>,
    {
        let (next, touches_modal, ended) = {
            let mut guard = self.state.lock();
            let current: &AppSnapshot = &guard;
            let Some(patch) = f(current) else {
                return Arc::clone(&guard);
            };
            let touches_modal = patch.touches_modal();
            let next = Arc::new(current.merged(patch));
            *guard = Arc::clone(&next);
            (next, touches_modal, self.writer.lock())
        };
        if !*ended {
            self.persist(&next, touches_modal);
        }
        drop(ended);

        self.notify(&next);
        if next.has_unencoded_images() {
            self.schedule_encoding();
        }
        next
    }

    /// Apply a typed update to one job. Unknown ids are ignored, invalid
    /// transitions are logged and ignored. Returns whether the job changed.
    pub fn update_job(&self, id: &JobId, update: JobUpdate) -> bool {
        let mut applied = false;
        self.update(|state| {
            let Some(index) = state.queue.iter().position(|job| &job.id == id) else {
                tracing::debug!(job_id = %id, "Update for unknown job ignored");
                return None;
            };
            let mut queue = state.queue.clone();
            match queue[index].apply(update) {
                Ok(()) => {
                    applied = true;
                    Some(StatePatch::queue(queue))
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Rejected job update");
                    None
                }
            }
        });
        applied
    }

    /// Register a listener called with every new snapshot.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<AppSnapshot>) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Resolve with the first snapshot for which `predicate` holds.
    pub async fn wait_for<P>(&self, predicate: P) -> Arc<AppSnapshot>
    where
        P: Fn(&AppSnapshot) -> bool,
    {
        let (tx, mut rx) = watch::channel(());
        let _subscription = self.subscribe(move |_| {
            let _ = tx.send(());
        });
        loop {
            let snapshot = self.state();
            if predicate(&snapshot) || rx.changed().await.is_err() {
                return snapshot;
            }
        }
    }

    /// Stop persisting and clear the session. Later mutations stay in memory.
    pub fn end_session(&self) -> Result<(), StorageError> {
        let mut ended = self.writer.lock();
        *ended = true;
        self.storage.clear()
    }

    pub fn is_session_ended(&self) -> bool {
        *self.writer.lock()
    }

    /// Run [`Store::encode_pending_images`] in the background unless a run is
    /// already active. Outside a Tokio runtime this does nothing.
    fn schedule_encoding(&self) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let Some(store) = self.this.upgrade() else {
            return;
        };
        if self.encoding.swap(true, Ordering::AcqRel) {
            return;
        }
        runtime.spawn(async move {
            loop {
                store.encode_pending_images().await;
                store.encoding.store(false, Ordering::Release);
                // Jobs added while the run was finishing would otherwise wait
                // for the next mutation.
                if !store.state().has_unencoded_images()
                    || store.encoding.swap(true, Ordering::AcqRel)
                {
                    break;
                }
            }
        });
    }

    /// Encode every in-memory image that has no persisted form yet and write
    /// the text back into its job. Returns how many jobs were updated.
    pub async fn encode_pending_images(&self) -> usize {
        let pending: Vec<_> = self
            .state()
            .queue
            .iter()
            .filter(|job| job.user_image_encoded.is_none())
            .filter_map(|job| Some((job.id.clone(), job.user_image.clone()?)))
            .collect();

        let mut encoded = 0;
        for (id, image) in pending {
            match codec::encode_async(image).await {
                Ok(text) => {
                    if self.update_job(&id, JobUpdate::ImageEncoded(text)) {
                        encoded += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Failed to encode image for persistence");
                }
            }
        }
        encoded
    }

    fn persist(&self, state: &AppSnapshot, modal: bool) {
        match serde_json::to_string(&state.to_persisted()) {
            Ok(json) => {
                if let Err(e) = self.storage.set(STATE_KEY, &json) {
                    tracing::warn!(error = %e, "Failed to save state, continuing in memory");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize state"),
        }

        if modal {
            let saved = serde_json::to_string(&state.modal_state())
                .map_err(|e| e.to_string())
                .and_then(|json| {
                    self.storage
                        .set(MODAL_STATE_KEY, &json)
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = saved {
                tracing::warn!(error = %e, "Failed to save modal state");
            }
        }
    }

    fn notify(&self, state: &Arc<AppSnapshot>) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// Load the persisted state. Jobs are read one by one so a single unreadable
/// entry costs only that job.
fn load_persisted(storage: &dyn SessionStorage) -> Option<PersistedState> {
    let text = match storage.get(STATE_KEY) {
        Ok(text) => text?,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load state");
            return None;
        }
    };

    let mut value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unreadable persisted state");
            return None;
        }
    };
    let raw_queue = value
        .as_object_mut()
        .and_then(|fields| fields.remove("queue"))
        .unwrap_or_default();

    let mut state: PersistedState = match serde_json::from_value(value) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unreadable persisted state");
            return None;
        }
    };

    let entries = match raw_queue {
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Null => Vec::new(),
        _ => {
            tracing::warn!("Persisted queue is not a list, ignoring it");
            Vec::new()
        }
    };
    state.queue = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<Job>(entry) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping unreadable persisted job");
                None
            }
        })
        .collect();
    Some(state)
}

fn load_modal_state(storage: &dyn SessionStorage) -> Option<ModalState> {
    let text = storage.get(MODAL_STATE_KEY).ok().flatten()?;
    serde_json::from_str(&text).ok()
}

fn load_or_create_session_id(storage: &dyn SessionStorage) -> String {
    if let Ok(Some(id)) = storage.get(SESSION_ID_KEY) {
        if !id.trim().is_empty() {
            return id;
        }
    }
    let id = Uuid::new_v4().to_string();
    if let Err(e) = storage.set(SESSION_ID_KEY, &id) {
        tracing::warn!(error = %e, "Failed to save session id");
    }
    id
}

/// Rebuild the in-memory image from its encoded form after a reload.
fn restore_image(mut job: Job) -> Job {
    if job.user_image.is_none() {
        if let Some(encoded) = &job.user_image_encoded {
            job.user_image = codec::decode(encoded);
            if job.user_image.is_none() {
                tracing::warn!(job_id = %job.id, "Persisted image could not be decoded");
            }
        }
    }
    job
}
