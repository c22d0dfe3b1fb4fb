use std::rc::Rc;

use smallvec::SmallVec;

use crate::ListenerId;

/// Listener snapshots up to this size are taken without touching the heap.
const INLINE_SNAPSHOT: usize = 8;

pub(crate) type Snapshot<L> = SmallVec<[Rc<L>; INLINE_SNAPSHOT]>;

/// An ordered list of listeners that is never iterated in place.
///
/// Dispatch works on a snapshot of the list taken at the start of the pass. The list itself
/// may therefore be freely modified by the listeners being invoked, with the changes taking
/// effect for the next pass.
#[derive(Debug)]
pub(crate) struct ListenerList<L: ?Sized> {
    entries: Vec<(ListenerId, Rc<L>)>,
}

impl<L: ?Sized> ListenerList<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, id: ListenerId, listener: Rc<L>) {
        self.entries.push((id, listener));
    }

    /// Removes the listener with the given id, returning whether it was present.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Returns the listeners in registration order, leaving the list as it is.
    pub(crate) fn snapshot(&self) -> Snapshot<L> {
        self.entries
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect()
    }

    /// Returns the listeners in registration order, leaving the list empty.
    pub(crate) fn take_snapshot(&mut self) -> Snapshot<L> {
        self.entries
            .drain(..)
            .map(|(_, listener)| listener)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
