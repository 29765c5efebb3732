// List binding - keeps a list control in step with a view over a store

mod editor;

pub use editor::{DeleteEditor, EditAction, Editor, FnEditor, NoEditor};

use crate::context::{ExecutionContext, Immediate};
use crate::diff::{compute_patch, Patch};
use crate::error::{Result, SectionDbError};
use crate::projection::{project, project_full, IndexPath, SearchListenerId, Snapshot, ViewDefinition};
use crate::record::{CompositeKey, Item};
use crate::store::{ChangeSet, Store, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// The consumer side of a binding, typically a UI list.
pub trait ListControl<T>: Send {
    /// Apply an incremental update. `new` is the snapshot the binding now exposes.
    fn apply_patch(&mut self, patch: &Patch, new: &Snapshot<T>) -> Result<()>;

    /// Discard everything and show `snapshot`.
    fn reload_data(&mut self, snapshot: &Snapshot<T>);
}

impl<T, C: ListControl<T>> ListControl<T> for Arc<Mutex<C>> {
    fn apply_patch(&mut self, patch: &Patch, new: &Snapshot<T>) -> Result<()> {
        self.lock().apply_patch(patch, new)
    }

    fn reload_data(&mut self, snapshot: &Snapshot<T>) {
        self.lock().reload_data(snapshot)
    }
}

/// A list control that keeps its own copy of the rows by applying patches.
///
/// Useful headless, and as a check that patches really do reproduce the
/// snapshot they were computed for.
pub struct SnapshotModel<T> {
    current: Snapshot<T>,
    patches: Vec<Patch>,
    reloads: usize,
}

impl<T> Default for SnapshotModel<T> {
    fn default() -> Self {
        SnapshotModel {
            current: Snapshot::empty(),
            patches: Vec::new(),
            reloads: 0,
        }
    }
}

impl<T> SnapshotModel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn current(&self) -> &Snapshot<T> {
        &self.current
    }

    /// Every patch applied so far, oldest first.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn last_patch(&self) -> Option<&Patch> {
        self.patches.last()
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }
}

impl<T: Send + Sync> ListControl<T> for SnapshotModel<T> {
    fn apply_patch(&mut self, patch: &Patch, new: &Snapshot<T>) -> Result<()> {
        let applied = patch.apply_to(&self.current, new)?;
        if !applied.same_layout(new) {
            return Err(SectionDbError::PatchRejected {
                reason: "patched rows do not match the new snapshot".to_string(),
            });
        }
        self.current = applied;
        self.patches.push(patch.clone());
        Ok(())
    }

    fn reload_data(&mut self, snapshot: &Snapshot<T>) {
        self.current = snapshot.clone();
        self.reloads += 1;
    }
}

/// Settings for [`ListBinding::bind`].
pub struct BindingOptions<T> {
    /// Shown by segmented selectors. Defaults to the view name.
    pub title: Option<String>,
    /// Where patches are applied. Defaults to [`Immediate`].
    pub context: Arc<dyn ExecutionContext>,
    pub editor: Arc<dyn Editor<T>>,
}

impl<T> Default for BindingOptions<T> {
    fn default() -> Self {
        BindingOptions {
            title: None,
            context: Arc::new(Immediate),
            editor: Arc::new(NoEditor),
        }
    }
}

impl<T> BindingOptions<T> {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_editor(mut self, editor: impl Editor<T> + 'static) -> Self {
        self.editor = Arc::new(editor);
        self
    }
}

enum BindingState {
    /// Subscribed, initial snapshot not shown yet. Change sets wait.
    Binding,
    Bound {
        subscription: SubscriptionId,
        search: Option<SearchListenerId>,
    },
    Unbound,
}

enum Refresh {
    Changes(ChangeSet),
    Full,
}

struct BindingShared<T> {
    id: String,
    title: String,
    view: ViewDefinition<T>,
    store: Store,
    context: Arc<dyn ExecutionContext>,
    editor: Arc<dyn Editor<T>>,
    control: Mutex<Box<dyn ListControl<T>>>,
    current: RwLock<Arc<Snapshot<T>>>,
    state: Mutex<BindingState>,
    pending: Mutex<VecDeque<Refresh>>,
    applying: AtomicBool,
    last_error: Mutex<Option<SectionDbError>>,
}

/// A view bound to a store and a list control.
///
/// Dropping the binding unbinds it.
pub struct ListBinding<T: 'static> {
    shared: Arc<BindingShared<T>>,
}

impl<T> ListBinding<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Subscribe to `store`, show the initial snapshot on `control`, and keep
    /// it current from then on.
    pub fn bind(
        id: impl Into<String>,
        store: &Store,
        view: ViewDefinition<T>,
        control: impl ListControl<T> + 'static,
        options: BindingOptions<T>,
    ) -> Result<Self> {
        let id = id.into();
        let shared = Arc::new(BindingShared {
            title: options.title.unwrap_or_else(|| view.name().to_string()),
            id,
            view,
            store: store.clone(),
            context: options.context,
            editor: options.editor,
            control: Mutex::new(Box::new(control)),
            current: RwLock::new(Arc::new(Snapshot::empty())),
            state: Mutex::new(BindingState::Binding),
            pending: Mutex::new(VecDeque::new()),
            applying: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        // Subscribe before the first projection so no commit falls in between.
        let weak = Arc::downgrade(&shared);
        let subscription = store.subscribe_collections(
            shared.view.collections().to_vec(),
            move |changes: &ChangeSet| {
                if let Some(shared) = weak.upgrade() {
                    BindingShared::enqueue(&shared, Refresh::Changes(changes.clone()));
                }
            },
        );
        let search = shared.view.search().map(|index| {
            let weak = Arc::downgrade(&shared);
            index.handle().subscribe(move |_term| {
                if let Some(shared) = weak.upgrade() {
                    BindingShared::enqueue(&shared, Refresh::Full);
                }
            })
        });

        let initial = match store.read(|txn| project_full(&shared.view, txn)) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                store.unsubscribe(subscription);
                if let (Some(index), Some(listener)) = (shared.view.search(), search) {
                    index.handle().unsubscribe(listener);
                }
                return Err(e);
            }
        };
        *shared.current.write() = initial.clone();
        shared.control.lock().reload_data(&initial);
        *shared.state.lock() = BindingState::Bound {
            subscription,
            search,
        };
        log::info!(
            "Bound '{}' to view '{}' with {} row(s)",
            shared.id,
            shared.view.name(),
            initial.len()
        );

        BindingShared::schedule(&shared);
        Ok(ListBinding { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn title(&self) -> &str {
        &self.shared.title
    }

    pub fn view(&self) -> &ViewDefinition<T> {
        &self.shared.view
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.shared.state.lock(), BindingState::Bound { .. })
    }

    // ── Read Contract ────────────────────────────────────────────────

    /// The snapshot the control was last brought up to date with.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.shared.current.read().clone()
    }

    pub fn number_of_sections(&self) -> usize {
        self.shared.current.read().section_count()
    }

    pub fn number_of_rows_in_section(&self, section: usize) -> usize {
        self.shared.current.read().row_count(section)
    }

    pub fn item_at(&self, path: IndexPath) -> Option<Arc<Item<T>>> {
        self.shared.current.read().item(path).cloned()
    }

    pub fn index_path_of(&self, key: &CompositeKey) -> Option<IndexPath> {
        self.shared.current.read().index_path_of(key)
    }

    /// Header title of a section: the view's header provider, or else the
    /// group label itself.
    pub fn header_title(&self, section: usize) -> Option<String> {
        let group = self.shared.current.read().sections.get(section)?.group.clone();
        match self
            .shared
            .store
            .read(|txn| Ok(self.shared.view.header_title(txn, &group)))
        {
            Ok(Some(title)) => Some(title),
            Ok(None) => Some(group),
            Err(e) => {
                log::warn!("Header lookup for '{group}' failed: {e}");
                Some(group)
            }
        }
    }

    // ── Editing Contract ─────────────────────────────────────────────

    pub fn can_edit(&self, path: IndexPath) -> bool {
        self.item_at(path)
            .map_or(false, |item| self.shared.editor.can_edit(&item))
    }

    pub fn edit_action(&self, path: IndexPath) -> EditAction {
        self.item_at(path)
            .map_or(EditAction::None, |item| self.shared.editor.edit_action(&item))
    }

    /// Commit an edit on the row at `path`. The row changes only once the
    /// resulting change set comes back through the store.
    pub fn commit_edit(&self, action: EditAction, path: IndexPath) -> Result<()> {
        let item = self.resolve(path)?;
        if !self.shared.editor.can_edit(&item) {
            return Err(SectionDbError::Other(format!("{} is not editable", item.key)));
        }
        self.shared
            .editor
            .commit_edit(&self.shared.store, action, &item)
    }

    pub fn can_move(&self, path: IndexPath) -> bool {
        self.item_at(path)
            .map_or(false, |item| self.shared.editor.can_move(&item))
    }

    pub fn commit_move(&self, from: IndexPath, to: IndexPath) -> Result<()> {
        let item = self.resolve(from)?;
        if !self.shared.editor.can_move(&item) {
            return Err(SectionDbError::Other(format!("{} cannot be moved", item.key)));
        }
        self.shared
            .editor
            .commit_move(&self.shared.store, &item, from, to)
    }

    fn resolve(&self, path: IndexPath) -> Result<Arc<Item<T>>> {
        if !self.is_bound() {
            return Err(SectionDbError::Unbound(self.shared.id.clone()));
        }
        self.item_at(path)
            .ok_or_else(|| SectionDbError::Other(format!("No row at {path} in '{}'", self.shared.id)))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Re-project from scratch and patch the control with the difference.
    pub fn refresh(&self) {
        BindingShared::enqueue(&self.shared, Refresh::Full);
    }

    /// The most recent error the binding recovered from, as text.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().as_ref().map(|e| e.to_string())
    }

    pub fn take_last_error(&self) -> Option<SectionDbError> {
        self.shared.last_error.lock().take()
    }

    /// Stop observing the store. The binding then exposes an empty snapshot.
    pub fn unbind(&self) {
        if self.shared.teardown() {
            log::info!("Unbound '{}'", self.shared.id);
        }
        *self.shared.current.write() = Arc::new(Snapshot::empty());
    }
}

impl<T: 'static> Drop for ListBinding<T> {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl<T> BindingShared<T> {
    /// Unsubscribe everything and drop queued refreshes. Returns whether the
    /// binding was bound.
    fn teardown(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), BindingState::Unbound);
        self.pending.lock().clear();
        match previous {
            BindingState::Bound {
                subscription,
                search,
            } => {
                self.store.unsubscribe(subscription);
                if let (Some(index), Some(listener)) = (self.view.search(), search) {
                    index.handle().unsubscribe(listener);
                }
                true
            }
            _ => false,
        }
    }
}

impl<T> BindingShared<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn enqueue(shared: &Arc<Self>, refresh: Refresh) {
        if matches!(*shared.state.lock(), BindingState::Unbound) {
            return;
        }
        shared.pending.lock().push_back(refresh);
        Self::schedule(shared);
    }

    fn schedule(shared: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(shared);
        shared.context.execute(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.drain();
            }
        }));
    }

    /// Apply queued refreshes in order. A refresh queued while one is being
    /// applied waits for it.
    fn drain(&self) {
        loop {
            if self
                .applying
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let guard = ApplyingGuard(&self.applying);

            loop {
                match *self.state.lock() {
                    BindingState::Bound { .. } => {}
                    BindingState::Binding => break,
                    BindingState::Unbound => {
                        self.pending.lock().clear();
                        break;
                    }
                }
                let next = self.pending.lock().pop_front();
                let Some(refresh) = next else { break };
                if panic::catch_unwind(AssertUnwindSafe(|| self.apply(refresh))).is_err() {
                    log::error!("'{}' list control panicked; reloading", self.id);
                    self.record_error(SectionDbError::PatchRejected {
                        reason: "list control panicked".to_string(),
                    });
                    let current = self.current.read().clone();
                    if panic::catch_unwind(AssertUnwindSafe(|| self.reload(current))).is_err() {
                        log::error!("'{}' list control panicked again on reload", self.id);
                    }
                }
            }

            drop(guard);
            let bound = matches!(*self.state.lock(), BindingState::Bound { .. });
            if !bound || self.pending.lock().is_empty() {
                return;
            }
        }
    }

    fn apply(&self, refresh: Refresh) {
        let previous = self.current.read().clone();
        let projected = match &refresh {
            Refresh::Changes(changes) => self
                .store
                .read(|txn| project(&self.view, txn, Some(previous.as_ref()), Some(changes))),
            Refresh::Full => self
                .store
                .read(|txn| project(&self.view, txn, None, None)),
        };

        let outcome = match projected {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Projection of '{}' failed: {e}; rebuilding", self.view.name());
                self.record_error(e);
                match self.store.read(|txn| project_full(&self.view, txn)) {
                    Ok(snapshot) => self.reload(Arc::new(snapshot)),
                    Err(e) => {
                        log::error!("Rebuild of '{}' failed: {e}", self.view.name());
                        self.record_error(e);
                    }
                }
                return;
            }
        };

        let next = Arc::new(outcome.snapshot);
        if let Some(e) = outcome.recovered {
            self.record_error(e);
            self.reload(next);
            return;
        }
        let patch = compute_patch(&previous, &next);
        *self.current.write() = next.clone();
        if patch.is_empty() {
            return;
        }
        log::debug!("'{}' applying {} op(s)", self.id, patch.len());

        let mut control = self.control.lock();
        if let Err(e) = control.apply_patch(&patch, &next) {
            log::warn!("'{}' control rejected patch ({e}); reloading", self.id);
            control.reload_data(&next);
            drop(control);
            let reason = match e {
                SectionDbError::PatchRejected { reason } => reason,
                other => other.to_string(),
            };
            self.record_error(SectionDbError::PatchRejected { reason });
        }
    }

    fn reload(&self, snapshot: Arc<Snapshot<T>>) {
        *self.current.write() = snapshot.clone();
        self.control.lock().reload_data(&snapshot);
    }

    fn record_error(&self, error: SectionDbError) {
        *self.last_error.lock() = Some(error);
    }
}

/// Clears the applying flag when dropped, including while unwinding.
struct ApplyingGuard<'a>(&'a AtomicBool);

impl Drop for ApplyingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
