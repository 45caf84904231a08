/// Identifier for one submitted batch of buffer accesses.
///
/// Handed back by [`crate::FenceEngine::process`] and used to force-unblock
/// the batch's frames through [`crate::FenceEngine::release`] if the
/// submission fails downstream. `Tag::NONE` is the "no synchronization was
/// registered" sentinel and is always safe to release.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag(u32);

impl Tag {
    pub const NONE: Tag = Tag(0);

    pub(crate) fn from_raw(raw: u32) -> Self {
        Tag(raw)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Direction of one buffer access within a submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// The operation reads the buffer.
    Source,
    /// The operation writes the buffer.
    Destination,
}

impl AccessKind {
    pub fn is_destination(&self) -> bool {
        matches!(self, AccessKind::Destination)
    }
}
