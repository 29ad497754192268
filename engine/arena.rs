// ========================================================================================
//
//                       The workspace arena: one region, strict LIFO
//
// ========================================================================================
//
// Every buffer the distance engine needs is carved out of a single region reserved once
// at startup. Allocation bumps a high-water mark; release is always "reset the mark to a
// checkpoint". There is no per-allocation free.
//
// Scoping is expressed through `Scope`. A scope remembers the mark at which it was
// opened and resets to it when dropped. Slices handed out by a scope carry the lifetime
// of the scope's *parent* borrow, so the borrow checker rejects any attempt to use an
// allocation after an enclosing checkpoint has been reset.

use crate::error::{DosageError, Result};
use std::alloc::{self, Layout};
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

/// Alignment of the region itself and of every cache-line allocation.
pub const CACHE_LINE: usize = 64;

/// Alignment kind requested for a raw byte allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Align {
    Word,
    CacheLine,
}

impl Align {
    #[inline]
    fn bytes(self) -> usize {
        match self {
            Self::Word => mem::size_of::<u64>(),
            Self::CacheLine => CACHE_LINE,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Plain-data element types that may live in the arena.
///
/// # Safety
/// Implementors must be `Copy`, have no drop glue, and accept any bit pattern written
/// through `ptr::write` of a value of the same type.
pub unsafe trait ArenaPod: Copy + sealed::Sealed + 'static {
    const ZERO: Self;
}

macro_rules! arena_pod {
    ($($ty:ty => $zero:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            unsafe impl ArenaPod for $ty {
                const ZERO: Self = $zero;
            }
        )*
    };
}

arena_pod!(u8 => 0, u32 => 0, u64 => 0, usize => 0, f64 => 0.0);

/// A position of the high-water mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

/// The single reserved region.
pub struct Arena {
    base: NonNull<u8>,
    capacity: usize,
    top: Cell<usize>,
}

impl Arena {
    /// Reserves `bytes` (rounded up to a whole cache line) once.
    pub fn with_capacity(bytes: usize) -> Result<Self> {
        let capacity = bytes
            .max(CACHE_LINE)
            .checked_next_multiple_of(CACHE_LINE)
            .ok_or(DosageError::OutOfMemory {
                requested: bytes,
                available: 0,
            })?;
        let layout = Layout::from_size_align(capacity, CACHE_LINE).map_err(|_| {
            DosageError::OutOfMemory {
                requested: capacity,
                available: 0,
            }
        })?;
        // SAFETY: `layout` has non-zero size. Zeroing once keeps every byte of the
        // region initialised for the lifetime of the arena.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(DosageError::OutOfMemory {
            requested: capacity,
            available: 0,
        })?;
        log::debug!("Reserved {capacity} bytes of workspace.");
        Ok(Self {
            base,
            capacity,
            top: Cell::new(0),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Opens the root scope. Everything allocated from it is released when it drops.
    pub fn scope(&mut self) -> Scope<'_> {
        let mark = Checkpoint(self.top.get());
        Scope { arena: self, mark }
    }

    /// Moves the mark to the next multiple of `align` at or above it and reserves
    /// `size` bytes. The mark is untouched on failure.
    fn bump(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let top = self.top.get();
        let oom = || DosageError::OutOfMemory {
            requested: size,
            available: self.capacity - top,
        };
        let start = top.checked_next_multiple_of(align).ok_or_else(oom)?;
        let end = start.checked_add(size).ok_or_else(oom)?;
        if end > self.capacity {
            return Err(oom());
        }
        self.top.set(end);
        // SAFETY: `start <= capacity`, so the offset stays inside (or one past) the region.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: the layout is identical to the one used in `with_capacity`.
        unsafe {
            alloc::dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, CACHE_LINE),
            );
        }
    }
}

/// A LIFO region of the arena. Dropping it resets the mark to where it was opened.
pub struct Scope<'a> {
    arena: &'a Arena,
    mark: Checkpoint,
}

impl<'a> Scope<'a> {
    /// The current high-water mark.
    #[inline]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.arena.top.get())
    }

    /// Bytes allocated since this scope was opened.
    #[inline]
    pub fn used(&self) -> usize {
        self.arena.top.get() - self.mark.0
    }

    /// Bytes still free in the whole region.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.arena.capacity - self.arena.top.get()
    }

    /// Opens a nested scope. Its allocations are released when it drops, and the parent
    /// cannot allocate while it is alive.
    pub fn child(&mut self) -> Scope<'_> {
        Scope {
            arena: self.arena,
            mark: self.checkpoint(),
        }
    }

    /// Explicitly resets to the checkpoint this scope was opened at.
    pub fn reset(self) {
        drop(self);
    }

    /// Reserves `size` zeroed bytes at the requested alignment.
    pub fn alloc_bytes(&self, size: usize, align: Align) -> Result<&'a mut [u8]> {
        let ptr = self.arena.bump(size, align.bytes())?;
        // SAFETY: the bump reserved `size` bytes exclusively for this slice, and they
        // are initialised before the reference is formed.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, size);
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), size))
        }
    }

    /// Reserves a cache-line-aligned slice of `len` copies of `value`.
    pub fn alloc_slice<T: ArenaPod>(&self, len: usize, value: T) -> Result<&'a mut [T]> {
        let ptr = self.alloc_raw::<T>(len)?;
        // SAFETY: `alloc_raw` reserved `len` properly aligned elements; each is written
        // before the slice is formed.
        unsafe {
            for idx in 0..len {
                ptr.as_ptr().add(idx).write(value);
            }
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }

    #[inline]
    pub fn alloc_zeroed<T: ArenaPod>(&self, len: usize) -> Result<&'a mut [T]> {
        self.alloc_slice(len, T::ZERO)
    }

    fn alloc_raw<T: ArenaPod>(&self, len: usize) -> Result<NonNull<T>> {
        let size = len
            .checked_mul(mem::size_of::<T>())
            .ok_or(DosageError::OutOfMemory {
                requested: usize::MAX,
                available: self.remaining(),
            })?;
        let align = CACHE_LINE.max(mem::align_of::<T>());
        Ok(self.arena.bump(size, align)?.cast())
    }

    /// Starts a slice that grows in place at the top of the arena. The parent scope
    /// cannot allocate until the growable is finished or dropped.
    pub fn growable<T: ArenaPod>(&mut self) -> ArenaVec<'_, 'a, T> {
        let start = self
            .arena
            .top
            .get()
            .checked_next_multiple_of(CACHE_LINE)
            .unwrap_or(self.arena.capacity)
            .min(self.arena.capacity);
        ArenaVec {
            arena: self.arena,
            start,
            len: 0,
            scope: PhantomData,
            element: PhantomData,
        }
    }

    /// Runs `build` inside a child scope and moves the slice it returns down to this
    /// scope's top once the child's scratch has been released.
    pub fn retain<T, F>(&mut self, build: F) -> Result<&'a mut [T]>
    where
        T: ArenaPod,
        F: for<'c> FnOnce(&mut Scope<'c>) -> Result<&'c mut [T]>,
    {
        let (src, len) = {
            let mut child = self.child();
            let built = build(&mut child)?;
            (built.as_ptr(), built.len())
        };
        let dst = self.alloc_raw::<T>(len)?;
        // SAFETY: `src` still points at `len` initialised elements: the child's reset only
        // moved the mark, and `alloc_raw` reserves at or below `src`. `ptr::copy` handles
        // the overlap.
        unsafe {
            ptr::copy(src, dst.as_ptr(), len);
            Ok(std::slice::from_raw_parts_mut(dst.as_ptr(), len))
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.arena.top.set(self.mark.0);
    }
}

/// A slice growing at the top of the arena. The unused tail is available as scratch.
pub struct ArenaVec<'s, 'a, T: ArenaPod> {
    arena: &'a Arena,
    start: usize,
    len: usize,
    scope: PhantomData<&'s mut Scope<'a>>,
    element: PhantomData<T>,
}

impl<'a, T: ArenaPod> ArenaVec<'_, 'a, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn end(&self) -> usize {
        self.start + self.len * mem::size_of::<T>()
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let end = self.end();
        let size = mem::size_of::<T>();
        if end + size > self.arena.capacity {
            return Err(DosageError::OutOfMemory {
                requested: size,
                available: self.arena.capacity - end,
            });
        }
        // SAFETY: `end` is aligned for `T` (start is cache-line aligned and every element
        // has the same size) and the element lies inside the region, above the mark.
        unsafe {
            self.arena.base.as_ptr().add(end).cast::<T>().write(value);
        }
        self.len += 1;
        Ok(())
    }

    /// Everything past the last pushed element, as bytes.
    pub fn spare_bytes(&mut self) -> &mut [u8] {
        let end = self.end();
        // SAFETY: the tail is above the mark, so nothing else references it while `self`
        // holds the exclusive borrow of the scope. The region was zeroed at reservation.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.as_ptr().add(end),
                self.arena.capacity - end,
            )
        }
    }

    /// Commits the pushed elements to the enclosing scope.
    pub fn finish(self) -> &'a mut [T] {
        let end = self.end();
        self.arena.top.set(end.max(self.arena.top.get()));
        // SAFETY: the elements are initialised and the mark now covers them.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.as_ptr().add(self.start).cast::<T>(),
                self.len,
            )
        }
    }
}
