use crate::error::Result;
use crate::projection::IndexPath;
use crate::record::Item;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What committing an edit on a row does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    Delete,
    Insert,
    None,
}

/// Editing policy of a binding. Every method has a read-only default.
pub trait Editor<T>: Send + Sync {
    fn can_edit(&self, _item: &Item<T>) -> bool {
        false
    }

    fn edit_action(&self, _item: &Item<T>) -> EditAction {
        EditAction::None
    }

    fn commit_edit(&self, _store: &Store, _action: EditAction, _item: &Item<T>) -> Result<()> {
        Ok(())
    }

    fn can_move(&self, _item: &Item<T>) -> bool {
        false
    }

    fn commit_move(&self, _store: &Store, _item: &Item<T>, _from: IndexPath, _to: IndexPath) -> Result<()> {
        Ok(())
    }
}

/// Rows cannot be edited or moved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEditor;

impl<T> Editor<T> for NoEditor {}

/// Swipe-to-delete: every row can be deleted, which removes its record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteEditor;

impl<T> Editor<T> for DeleteEditor {
    fn can_edit(&self, _item: &Item<T>) -> bool {
        true
    }

    fn edit_action(&self, _item: &Item<T>) -> EditAction {
        EditAction::Delete
    }

    fn commit_edit(&self, store: &Store, action: EditAction, item: &Item<T>) -> Result<()> {
        if action == EditAction::Delete {
            log::debug!("Deleting {}", item.key);
            store.remove_key(&item.key)?;
        }
        Ok(())
    }
}

type Predicate<T> = Arc<dyn Fn(&Item<T>) -> bool + Send + Sync>;
type ActionFn<T> = Arc<dyn Fn(&Item<T>) -> EditAction + Send + Sync>;
type CommitEditFn<T> = Arc<dyn Fn(&Store, EditAction, &Item<T>) -> Result<()> + Send + Sync>;
type CommitMoveFn<T> = Arc<dyn Fn(&Store, &Item<T>, IndexPath, IndexPath) -> Result<()> + Send + Sync>;

/// An editor assembled from closures. Anything left unset keeps the
/// read-only default.
pub struct FnEditor<T> {
    can_edit: Option<Predicate<T>>,
    edit_action: Option<ActionFn<T>>,
    commit_edit: Option<CommitEditFn<T>>,
    can_move: Option<Predicate<T>>,
    commit_move: Option<CommitMoveFn<T>>,
}

impl<T> Default for FnEditor<T> {
    fn default() -> Self {
        FnEditor {
            can_edit: None,
            edit_action: None,
            commit_edit: None,
            can_move: None,
            commit_move: None,
        }
    }
}

impl<T> FnEditor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_edit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Item<T>) -> bool + Send + Sync + 'static,
    {
        self.can_edit = Some(Arc::new(f));
        self
    }

    pub fn edit_action<F>(mut self, f: F) -> Self
    where
        F: Fn(&Item<T>) -> EditAction + Send + Sync + 'static,
    {
        self.edit_action = Some(Arc::new(f));
        self
    }

    pub fn commit_edit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Store, EditAction, &Item<T>) -> Result<()> + Send + Sync + 'static,
    {
        self.commit_edit = Some(Arc::new(f));
        self
    }

    pub fn can_move<F>(mut self, f: F) -> Self
    where
        F: Fn(&Item<T>) -> bool + Send + Sync + 'static,
    {
        self.can_move = Some(Arc::new(f));
        self
    }

    pub fn commit_move<F>(mut self, f: F) -> Self
    where
        F: Fn(&Store, &Item<T>, IndexPath, IndexPath) -> Result<()> + Send + Sync + 'static,
    {
        self.commit_move = Some(Arc::new(f));
        self
    }
}

impl<T> Editor<T> for FnEditor<T> {
    fn can_edit(&self, item: &Item<T>) -> bool {
        self.can_edit.as_ref().map_or(false, |f| f(item))
    }

    fn edit_action(&self, item: &Item<T>) -> EditAction {
        self.edit_action
            .as_ref()
            .map_or(EditAction::None, |f| f(item))
    }

    fn commit_edit(&self, store: &Store, action: EditAction, item: &Item<T>) -> Result<()> {
        match &self.commit_edit {
            Some(f) => f(store, action, item),
            None => Ok(()),
        }
    }

    fn can_move(&self, item: &Item<T>) -> bool {
        self.can_move.as_ref().map_or(false, |f| f(item))
    }

    fn commit_move(&self, store: &Store, item: &Item<T>, from: IndexPath, to: IndexPath) -> Result<()> {
        match &self.commit_move {
            Some(f) => f(store, item, from, to),
            None => Ok(()),
        }
    }
}
