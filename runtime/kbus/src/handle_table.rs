//! Handle table
//!
//! Maps small integer handles (device minors, namespace majors) to
//! objects so a parent can look children up without scanning. Freed
//! handles are recycled before the table grows, the same way a CSpace
//! slot allocator reuses freed slots.

/// Small integer handle
pub type Handle = u32;

/// Table of objects indexed by small integer handles
#[derive(Debug)]
pub struct HandleTable<T> {
    /// First handle handed out (lower handles are reserved)
    base: Handle,
    /// Slots, index 0 corresponds to `base`
    slots: Vec<Option<T>>,
    /// Freed slots, reused LIFO
    free: Vec<Handle>,
    /// Number of occupied slots
    len: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table handing out handles from `base` upwards
    pub fn with_base(base: Handle) -> Self {
        Self {
            base,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value and return its handle
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;

        // Try to reuse a freed slot first
        if let Some(handle) = self.free.pop() {
            self.slots[(handle - self.base) as usize] = Some(value);
            return handle;
        }

        self.slots.push(Some(value));
        self.base + (self.slots.len() as Handle - 1)
    }

    /// Look up a handle
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let index = handle.checked_sub(self.base)? as usize;
        self.slots.get(index)?.as_ref()
    }

    /// Look up a handle for modification
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = handle.checked_sub(self.base)? as usize;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Remove a handle, returning its value
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = handle.checked_sub(self.base)? as usize;
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(handle);
        self.len -= 1;
        Some(value)
    }

    /// Number of occupied handles
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no handle is in use
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over occupied handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(i, slot)| slot.as_ref().map(|v| (self.base + i as Handle, v)))
    }
}
