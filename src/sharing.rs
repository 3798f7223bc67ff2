// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// `Writable` is a shared cell that multiple owners can read and write.
/// Clones share the same underlying value. Use this to observe state from
/// callbacks that are moved into a trace or filter.
pub struct Writable<T>(Rc<RefCell<T>>);

impl<T> Writable<T> {
    pub fn new(value: T) -> Self {
        Writable(Rc::new(RefCell::new(value)))
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// Returns a read-only view sharing the same value.
    pub fn read_only(&self) -> ReadOnly<T> {
        ReadOnly(self.0.clone())
    }
}

impl<T> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Writable(self.0.clone())
    }
}

impl<T: Default> Default for Writable<T> {
    fn default() -> Self {
        Writable::new(T::default())
    }
}

/// `ReadOnly` is the read half of a `Writable`.
pub struct ReadOnly<T>(Rc<RefCell<T>>);

impl<T> ReadOnly<T> {
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }
}

impl<T> Clone for ReadOnly<T> {
    fn clone(&self) -> Self {
        ReadOnly(self.0.clone())
    }
}
