use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::ScopeError;

/// A zero-initialized block of foreign memory owned by a [`Scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl Buffer {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the buffer is used.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Temporary memory for exactly one call.
///
/// Every buffer handed out stays valid until the scope is closed or dropped.
pub trait Scope {
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<Buffer, ScopeError>;

    /// Releases every buffer of this scope.
    fn close(self: Box<Self>) -> Result<(), ScopeError>;
}

pub trait ScopeProvider: Send + Sync {
    fn new_scope(&self) -> Result<Box<dyn Scope>, ScopeError>;
}

const CHUNK_ALIGN: usize = 16;

/// Chunked bump allocator backing the default [`ScopeProvider`].
#[derive(Debug)]
pub struct Arena {
    chunks: Vec<(NonNull<u8>, Layout)>,
    // bytes used in the last chunk
    cursor: usize,
    chunk_size: usize,
    allocations: usize,
}

impl Arena {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            cursor: 0,
            chunk_size: chunk_size.max(CHUNK_ALIGN),
            allocations: 0,
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let (chunk, layout) = self.chunks.last()?;
        let base = chunk.as_ptr() as usize;
        let start = (base + self.cursor).next_multiple_of(align);
        let end = start.checked_add(size)?;
        if end > base + layout.size() {
            return None;
        }
        self.cursor = end - base;
        // SAFETY: start lies inside the chunk, which is non-null
        Some(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }

    fn grow(&mut self, size: usize, align: usize) -> Result<(), ScopeError> {
        let oom = ScopeError::OutOfMemory { size, align };
        let capacity = size
            .checked_add(align)
            .ok_or_else(|| oom.clone())?
            .max(self.chunk_size);
        let layout = Layout::from_size_align(capacity, align.max(CHUNK_ALIGN))
            .map_err(|_| oom.clone())?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(oom)?;
        self.chunks.push((ptr, layout));
        self.cursor = 0;
        Ok(())
    }
}

impl Scope for Arena {
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<Buffer, ScopeError> {
        if !align.is_power_of_two() {
            return Err(ScopeError::InvalidAlignment { align });
        }
        let size = size.max(1);
        let ptr = match self.bump(size, align) {
            Some(ptr) => ptr,
            None => {
                self.grow(size, align)?;
                self.bump(size, align)
                    .ok_or(ScopeError::OutOfMemory { size, align })?
            }
        };
        self.allocations += 1;
        Ok(Buffer { ptr, len: size })
    }

    fn close(self: Box<Self>) -> Result<(), ScopeError> {
        log::trace!(
            "closing arena: {} allocations in {} chunks",
            self.allocations,
            self.chunks.len()
        );
        drop(self);
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for (ptr, layout) in self.chunks.drain(..) {
            // SAFETY: allocated in `grow` with exactly this layout
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaProvider {
    chunk_size: usize,
}

impl ArenaProvider {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl ScopeProvider for ArenaProvider {
    fn new_scope(&self) -> Result<Box<dyn Scope>, ScopeError> {
        Ok(Box::new(Arena::new(self.chunk_size)))
    }
}
