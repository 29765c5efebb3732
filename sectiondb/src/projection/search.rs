use crate::record::Item;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type TermListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies a listener registered with [`Search::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchListenerId(u64);

struct SearchInner {
    term: RwLock<String>,
    listeners: Mutex<Vec<(SearchListenerId, TermListener)>>,
    next_id: AtomicU64,
}

/// A shared, mutable search term.
///
/// Clones share the term. Every binding whose view searches with this handle
/// re-evaluates when the term changes. Debouncing keystrokes is up to the caller.
#[derive(Clone)]
pub struct Search {
    inner: Arc<SearchInner>,
}

impl Default for Search {
    fn default() -> Self {
        Self::new()
    }
}

impl Search {
    pub fn new() -> Self {
        Search {
            inner: Arc::new(SearchInner {
                term: RwLock::new(String::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn term(&self) -> String {
        self.inner.term.read().clone()
    }

    /// Replace the term. Listeners run only if it actually changed.
    pub fn set_term(&self, term: impl Into<String>) -> bool {
        let term = term.into();
        {
            let mut current = self.inner.term.write();
            if *current == term {
                return false;
            }
            *current = term.clone();
        }
        log::debug!("Search term changed to {term:?}");

        let listeners: Vec<TermListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&term);
        }
        true
    }

    pub fn subscribe<F>(&self, listener: F) -> SearchListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = SearchListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SearchListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    /// Terms shorter than this (after trimming) match nothing.
    pub min_term_length: usize,
    pub case_sensitive: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            min_term_length: 1,
            case_sensitive: false,
        }
    }
}

/// The search stage of a view: a term handle plus the text field it matches.
pub struct SearchIndex<T> {
    search: Search,
    text: Arc<dyn Fn(&Item<T>) -> Option<String> + Send + Sync>,
    options: SearchOptions,
}

impl<T> Clone for SearchIndex<T> {
    fn clone(&self) -> Self {
        SearchIndex {
            search: self.search.clone(),
            text: self.text.clone(),
            options: self.options,
        }
    }
}

impl<T> SearchIndex<T> {
    pub fn new<F>(search: Search, text: F) -> Self
    where
        F: Fn(&Item<T>) -> Option<String> + Send + Sync + 'static,
    {
        SearchIndex {
            search,
            text: Arc::new(text),
            options: SearchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handle(&self) -> &Search {
        &self.search
    }

    pub fn options(&self) -> SearchOptions {
        self.options
    }

    /// The current term as matched against, or `None` when it is too short
    /// to search with.
    pub fn normalized_term(&self) -> Option<String> {
        let term = self.search.term();
        let term = term.trim();
        if term.chars().count() < self.options.min_term_length.max(1) {
            return None;
        }
        Some(self.normalize(term))
    }

    /// Prefix match of the item's indexed text against a normalized term.
    pub fn matches(&self, term: &str, item: &Item<T>) -> bool {
        match (self.text)(item) {
            Some(text) => self.normalize(&text).starts_with(term),
            None => false,
        }
    }

    fn normalize(&self, text: &str) -> String {
        if self.options.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }
}
