// Segmented composition - several bindings behind one selector, one visible at a time

use crate::binding::{EditAction, ListBinding};
use crate::error::{Result, SectionDbError};
use crate::projection::{IndexPath, Snapshot};
use crate::record::Item;
use serde::de::DeserializeOwned;
use std::sync::Arc;

type SelectionHandler<T> = Box<dyn Fn(usize, &ListBinding<T>) + Send + Sync>;

/// An ordered set of independently bound lists plus the index of the one
/// currently shown. Switching segments leaves the others bound.
pub struct SegmentedBinding<T: 'static> {
    id: String,
    segments: Vec<ListBinding<T>>,
    selected: usize,
    on_select: Option<SelectionHandler<T>>,
}

impl<T> SegmentedBinding<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, segments: Vec<ListBinding<T>>, selected: usize) -> Result<Self> {
        let id = id.into();
        if segments.is_empty() {
            return Err(SectionDbError::Config(format!(
                "Segmented binding '{id}' needs at least one segment"
            )));
        }
        if selected >= segments.len() {
            return Err(SectionDbError::InvalidSelection {
                index: selected,
                count: segments.len(),
            });
        }
        Ok(SegmentedBinding {
            id,
            segments,
            selected,
            on_select: None,
        })
    }

    /// Called after every successful [`SegmentedBinding::select`], typically
    /// to reload the list control from the newly selected binding.
    pub fn with_selection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &ListBinding<T>) + Send + Sync + 'static,
    {
        self.on_select = Some(Box::new(handler));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Titles of all segments, in order, for the selector.
    pub fn titles(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.title().to_string()).collect()
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> &ListBinding<T> {
        &self.segments[self.selected]
    }

    pub fn segment(&self, index: usize) -> Option<&ListBinding<T>> {
        self.segments.get(index)
    }

    pub fn select(&mut self, index: usize) -> Result<()> {
        if index >= self.segments.len() {
            return Err(SectionDbError::InvalidSelection {
                index,
                count: self.segments.len(),
            });
        }
        self.selected = index;
        log::debug!("'{}' selected segment {index}", self.id);
        if let Some(handler) = &self.on_select {
            handler(index, &self.segments[index]);
        }
        Ok(())
    }

    // Read and editing contracts of the selected segment

    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.selected().snapshot()
    }

    pub fn number_of_sections(&self) -> usize {
        self.selected().number_of_sections()
    }

    pub fn number_of_rows_in_section(&self, section: usize) -> usize {
        self.selected().number_of_rows_in_section(section)
    }

    pub fn item_at(&self, path: IndexPath) -> Option<Arc<Item<T>>> {
        self.selected().item_at(path)
    }

    pub fn header_title(&self, section: usize) -> Option<String> {
        self.selected().header_title(section)
    }

    pub fn can_edit(&self, path: IndexPath) -> bool {
        self.selected().can_edit(path)
    }

    pub fn edit_action(&self, path: IndexPath) -> EditAction {
        self.selected().edit_action(path)
    }

    pub fn commit_edit(&self, action: EditAction, path: IndexPath) -> Result<()> {
        self.selected().commit_edit(action, path)
    }

    pub fn can_move(&self, path: IndexPath) -> bool {
        self.selected().can_move(path)
    }

    pub fn commit_move(&self, from: IndexPath, to: IndexPath) -> Result<()> {
        self.selected().commit_move(from, to)
    }
}
