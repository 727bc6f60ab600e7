//! Live text surface shared between the UI and a pad.
//!
//! The UI owns rendering and key handling; all the pad needs is the current
//! text and selection, plus a way to replace both atomically when a rebased
//! result lands. [`SharedTextBox`] is a cheap clonable handle around one
//! locked [`TextBox`].

use std::sync::{Arc, Mutex, MutexGuard};

use crate::ot::Selection;

/// Plain text plus a selection, in `char` offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBox {
    value: String,
    selection: Selection,
    editable: bool,
}

impl TextBox {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    /// Replace the contents; the selection is clamped to the new length.
    pub fn replace(&mut self, value: String, selection: Selection) {
        let len = value.chars().count();
        self.value = value;
        self.selection = selection.clamp(len);
    }

    /// Replace the current selection with `text` and put the caret after it.
    pub fn insert(&mut self, text: &str) {
        let sel = self.selection.clamp(self.value.chars().count());
        let start = byte_offset(&self.value, sel.start);
        let end = byte_offset(&self.value, sel.end);
        self.value.replace_range(start..end, text);
        self.selection = Selection::caret(sel.start + text.chars().count());
    }

    /// Delete the selection, or the character before a caret.
    pub fn backspace(&mut self) {
        let sel = self.selection.clamp(self.value.chars().count());
        let from = if sel.is_caret() {
            match sel.start.checked_sub(1) {
                Some(from) => from,
                None => return,
            }
        } else {
            sel.start
        };
        let start = byte_offset(&self.value, from);
        let end = byte_offset(&self.value, sel.end);
        self.value.replace_range(start..end, "");
        self.selection = Selection::caret(from);
    }

    pub fn select(&mut self, selection: Selection) {
        self.selection = selection.clamp(self.value.chars().count());
    }
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// Clonable handle to a text box shared between the UI and a pad.
#[derive(Debug, Clone, Default)]
pub struct SharedTextBox {
    inner: Arc<Mutex<TextBox>>,
}

impl SharedTextBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the text box. The pad holds this lock for the whole staleness
    /// check and update of a rebased result.
    pub fn lock(&self) -> MutexGuard<'_, TextBox> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn value(&self) -> String {
        self.lock().value.clone()
    }

    pub fn selection(&self) -> Selection {
        self.lock().selection
    }

    pub fn snapshot(&self) -> (String, Selection) {
        let tb = self.lock();
        (tb.value.clone(), tb.selection)
    }

    pub fn is_editable(&self) -> bool {
        self.lock().editable
    }

    /// Apply a user edit. Returns `false` and leaves the text untouched
    /// while the box is read-only (before the first snapshot).
    pub fn edit(&self, f: impl FnOnce(&mut TextBox)) -> bool {
        let mut tb = self.lock();
        if !tb.editable {
            return false;
        }
        f(&mut tb);
        true
    }

    /// Type `text` at the current selection.
    pub fn type_text(&self, text: &str) -> bool {
        self.edit(|tb| tb.insert(text))
    }
}
