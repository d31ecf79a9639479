//! Fiber stack allocation
//!
//! A fiber owns exactly one [`Stack`]; the memory comes from a pluggable
//! [`StackAllocator`]. Three allocators are provided:
//! - [`HeapStackAllocator`]: plain block from the global allocator (default)
//! - [`MmapStackAllocator`]: anonymous mapping with a guard page below the stack
//! - [`PooledStackAllocator`]: keeps freed blocks of each size for reuse

use crate::config::{ConfigVar, FiberConfig};
use crate::defaults::{DEFAULT_STACK_POOL_SIZE, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Stack alignment required by the x86-64 and AArch64 ABIs
const STACK_ALIGN: usize = 16;

/// Source of raw memory blocks used as fiber stacks
pub trait StackAllocator: Send + Sync {
    /// Allocate a block of at least `size` bytes, 16-byte aligned
    fn allocate(&self, size: usize) -> io::Result<NonNull<u8>>;

    /// Return a block obtained from [`allocate`](Self::allocate)
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate(size)` on this allocator
    /// and must not be in use as a live stack.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Stacks from the global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> io::Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a non-zero size (sizes are clamped to MIN_STACK_SIZE).
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, STACK_ALIGN);
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Stacks from anonymous mappings with a `PROT_NONE` guard page below them,
/// so an overflow faults instead of silently corrupting the heap.
#[derive(Debug, Clone, Copy)]
pub struct MmapStackAllocator {
    page_size: usize,
}

impl MmapStackAllocator {
    /// Create an allocator using the system page size
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: if page > 0 { page as usize } else { 4096 },
        }
    }

    fn mapping_len(&self, size: usize) -> usize {
        size.div_ceil(self.page_size) * self.page_size + self.page_size
    }
}

impl Default for MmapStackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StackAllocator for MmapStackAllocator {
    fn allocate(&self, size: usize) -> io::Result<NonNull<u8>> {
        let len = self.mapping_len(size);
        // SAFETY: fresh private anonymous mapping, no aliasing.
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            if libc::mprotect(base, self.page_size, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(base, len);
                return Err(err);
            }
            let stack = (base as *mut u8).add(self.page_size);
            Ok(NonNull::new_unchecked(stack))
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let base = ptr.as_ptr().sub(self.page_size);
        libc::munmap(base.cast(), self.mapping_len(size));
    }
}

/// A freed block waiting in the pool
struct FreeBlock(NonNull<u8>);

// SAFETY: a pooled block is unused memory owned by the pool.
unsafe impl Send for FreeBlock {}

/// Keeps up to `max_per_size` freed stacks of each size and hands them out
/// again before asking the inner allocator.
pub struct PooledStackAllocator {
    inner: Arc<dyn StackAllocator>,
    max_per_size: usize,
    free: Mutex<HashMap<usize, Vec<FreeBlock>>>,
}

impl PooledStackAllocator {
    /// Pool blocks from `inner`, holding at most `max_per_size` per size
    pub fn new(inner: Arc<dyn StackAllocator>, max_per_size: usize) -> Self {
        Self {
            inner,
            max_per_size,
            free: Mutex::new(HashMap::new()),
        }
    }

    /// Number of pooled blocks of `size`
    pub fn pooled(&self, size: usize) -> usize {
        self.free.lock().get(&size).map_or(0, Vec::len)
    }
}

impl Default for PooledStackAllocator {
    fn default() -> Self {
        Self::new(Arc::new(HeapStackAllocator), DEFAULT_STACK_POOL_SIZE)
    }
}

impl StackAllocator for PooledStackAllocator {
    fn allocate(&self, size: usize) -> io::Result<NonNull<u8>> {
        if let Some(block) = self.free.lock().get_mut(&size).and_then(Vec::pop) {
            return Ok(block.0);
        }
        self.inner.allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        {
            let mut free = self.free.lock();
            let blocks = free.entry(size).or_default();
            if blocks.len() < self.max_per_size {
                blocks.push(FreeBlock(ptr));
                return;
            }
        }
        // Pool is full for this size
        self.inner.deallocate(ptr, size);
    }
}

impl Drop for PooledStackAllocator {
    fn drop(&mut self) {
        for (size, blocks) in self.free.get_mut().drain() {
            for block in blocks {
                // SAFETY: every pooled block came from inner.allocate(size).
                unsafe { self.inner.deallocate(block.0, size) };
            }
        }
    }
}

/// A stack block owned by one fiber; returned to its allocator on drop
pub(crate) struct Stack {
    base: NonNull<u8>,
    size: usize,
    allocator: Arc<dyn StackAllocator>,
}

// SAFETY: the block is exclusively owned; the allocator is Send + Sync.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    pub(crate) fn new(size: usize, allocator: Arc<dyn StackAllocator>) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE).next_multiple_of(STACK_ALIGN);
        let base = allocator.allocate(size)?;
        Ok(Self {
            base,
            size,
            allocator,
        })
    }

    /// Lowest address of the block
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: base/size came from allocator.allocate and the owning fiber
        // is no longer running on it.
        unsafe { self.allocator.deallocate(self.base, self.size) };
    }
}

/// Stack policy shared by a scheduler and the fibers it creates
///
/// The default size is a live [`ConfigVar`]: changing it affects every fiber
/// created afterwards.
#[derive(Clone)]
pub struct StackOptions {
    size: Arc<ConfigVar<usize>>,
    allocator: Arc<dyn StackAllocator>,
}

impl StackOptions {
    /// Options from an explicit size variable and allocator
    pub fn new(size: Arc<ConfigVar<usize>>, allocator: Arc<dyn StackAllocator>) -> Self {
        Self { size, allocator }
    }

    /// Heap-allocated stacks of `size` bytes
    pub fn with_size(size: usize) -> Self {
        Self::new(
            ConfigVar::new("fiber.stack_size", size, "fiber stack size"),
            Arc::new(HeapStackAllocator),
        )
    }

    /// Options from the `[fiber]` config section
    pub fn from_config(config: &FiberConfig) -> Self {
        Self::with_size(config.stack_size)
    }

    /// Replace the allocator
    pub fn allocator(mut self, allocator: Arc<dyn StackAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Current default stack size
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Live variable backing the default size
    pub fn size_var(&self) -> &Arc<ConfigVar<usize>> {
        &self.size
    }

    /// Allocate a stack; `requested == 0` selects the default size
    pub(crate) fn allocate(&self, requested: usize) -> io::Result<Stack> {
        let size = if requested == 0 { self.size() } else { requested };
        Stack::new(size, self.allocator.clone())
    }
}

impl Default for StackOptions {
    fn default() -> Self {
        Self::with_size(DEFAULT_STACK_SIZE)
    }
}

impl fmt::Debug for StackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackOptions")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
