/// Opaque index of a virtual resource inside the registry.
///
/// Handles are dense, zero-based and never reused; the registry that issued
/// a handle is the only place it may be dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Opaque index of a pass in graph insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderPassHandle(u32);

impl RenderPassHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Default for RenderPassHandle {
    fn default() -> Self {
        Self::INVALID
    }
}
