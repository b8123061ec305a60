use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cmp::max;
use std::collections::HashMap;
use std::fmt;
use std::mem::{align_of, size_of};

pub(crate) fn allocate(layout: Layout) -> *mut u8 {
    unsafe {
        let ptr = alloc(layout);

        if ptr.is_null() {
            handle_alloc_error(layout);
        } else {
            ptr
        }
    }
}

/// Metadata describing a type, produced by the compiler.
///
/// The runtime only reads the alignment, everything else is passed through
/// as-is.
#[repr(C)]
#[derive(Debug)]
pub struct TypeDesc {
    /// The size (in bytes) of values of this type.
    pub size: usize,

    /// The alignment (in bytes) of values of this type.
    pub align: usize,
}

/// The header of a box allocated in a task-local heap.
///
/// The body of the box follows the header, aligned according to the box's type
/// descriptor.
///
/// The order of the fields is fixed as generated code accesses these directly.
#[repr(C)]
pub struct OpaqueBox {
    pub ref_count: usize,
    pub type_desc: *const TypeDesc,
}

impl OpaqueBox {
    /// Returns the offset of the body relative to the start of the box.
    pub(crate) fn body_offset(align: usize) -> usize {
        let header = size_of::<OpaqueBox>();

        (header + (align - 1)) & !(align - 1)
    }

    /// Returns a pointer to the body of a box.
    pub(crate) unsafe fn body(boxed: *mut OpaqueBox) -> *mut u8 {
        let align = max((*(*boxed).type_desc).align, 1);

        (boxed as *mut u8).add(Self::body_offset(align))
    }

    fn layout(desc: &TypeDesc, size: usize) -> Result<Layout, AllocError> {
        let align = max(desc.align, align_of::<OpaqueBox>());

        if !align.is_power_of_two() {
            return Err(AllocError::Alignment(desc.align));
        }

        Self::body_offset(align)
            .checked_add(size)
            .and_then(|total| Layout::from_size_align(total, align).ok())
            .ok_or(AllocError::Size(size))
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum AllocError {
    /// The type descriptor specifies an alignment that isn't a power of two.
    Alignment(usize),

    /// The requested size is too great.
    Size(usize),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocError::Alignment(align) => {
                write!(f, "the alignment {} isn't a power of two", align)
            }
            AllocError::Size(size) => {
                write!(f, "a box with {} bytes of data is too large", size)
            }
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum FreeError {
    /// The box isn't allocated by this region, or it's already released.
    NotLive(usize),
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FreeError::NotLive(ptr) => write!(
                f,
                "the box {:#x} isn't owned by this task or is already freed",
                ptr
            ),
        }
    }
}

/// The heap of boxes owned by a single task.
///
/// Every live box is tracked, such that releasing a box twice or releasing a
/// box owned by another task is detected instead of corrupting the heap.
pub(crate) struct BoxedRegion {
    live: HashMap<usize, Layout>,
}

impl BoxedRegion {
    pub(crate) fn new() -> Self {
        Self { live: HashMap::new() }
    }

    /// Allocates a box for a value described by `desc`, with `size` bytes of
    /// data.
    pub(crate) fn malloc(
        &mut self,
        desc: *const TypeDesc,
        size: usize,
    ) -> Result<*mut OpaqueBox, AllocError> {
        let layout = OpaqueBox::layout(unsafe { &*desc }, size)?;
        let boxed = allocate(layout) as *mut OpaqueBox;
        let header = unsafe { &mut *boxed };

        init!(header.ref_count => 1);
        init!(header.type_desc => desc);
        self.live.insert(boxed as usize, layout);
        Ok(boxed)
    }

    pub(crate) fn free(&mut self, boxed: *mut OpaqueBox) -> Result<(), FreeError> {
        let layout = self
            .live
            .remove(&(boxed as usize))
            .ok_or(FreeError::NotLive(boxed as usize))?;

        unsafe { dealloc(boxed as *mut u8, layout) };
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, boxed: *mut OpaqueBox) -> bool {
        self.live.contains_key(&(boxed as usize))
    }

    /// Returns the number of live boxes.
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

impl Drop for BoxedRegion {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            log::warn!("releasing {} leaked box(es)", self.live.len());
        }

        for (&ptr, &layout) in &self.live {
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}
