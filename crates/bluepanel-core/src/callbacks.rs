//! Listener registry used by every service to publish change notifications.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handle returned by [`Callbacks::register`], used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback<T> = Rc<dyn Fn(&T)>;

/// A list of listeners for values of type `T`.
///
/// Listeners are invoked in registration order. The list is snapshotted
/// before dispatch, so a listener may register or unregister listeners
/// (including itself) without invalidating the iteration.
pub struct Callbacks<T> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(CallbackId, Callback<T>)>>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&T) + 'static,
    {
        let id = CallbackId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Remove a listener. Returns false if the id was unknown.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, value: &T) {
        let listeners: Vec<Callback<T>> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}
