use crate::config::Config;
use crate::memory_map::MemoryMap;
use log::debug;
use rustix::param::page_size;
use std::cmp::{max, min};
use std::fmt;
use std::io;
use std::ptr::copy_nonoverlapping;

/// The number of bytes below the stack pointer that leaf functions may use
/// without adjusting the stack pointer.
pub(crate) const RED_ZONE_SIZE: usize = 128;

/// Generated code with frames smaller than this compares the stack pointer to
/// the limit directly, instead of first subtracting the frame size.
pub(crate) const LIMIT_OFFSET: usize = 256;

/// The amount of memory at the bottom of a segment that sits below its stack
/// limit.
pub(crate) const LIMIT_RESERVE: usize = LIMIT_OFFSET + RED_ZONE_SIZE;

/// Segments grow by doubling, up to this size.
const MAX_SEGMENT_GROWTH: usize = 1024 * 1024;

const STACK_ALIGNMENT: usize = 16;

pub(crate) fn align_down(value: usize) -> usize {
    value & !(STACK_ALIGNMENT - 1)
}

/// Turns a recorded stack pointer into one that's safe to resume on.
///
/// The recorded pointer is obtained somewhere inside the frame of the function
/// that switched stacks, so we skip the red zone and align it.
pub(crate) fn sanitize_stack_pointer(pointer: usize) -> usize {
    align_down(pointer - RED_ZONE_SIZE)
}

#[derive(Debug)]
pub enum StackError {
    /// The memory for a new segment couldn't be mapped.
    Allocate(io::Error),

    /// Growing would exceed the maximum stack size of the task.
    Exhausted { used: usize, limit: usize },

    /// There's no segment to return to.
    Underflow,

    /// The stack pointer doesn't reside in any segment of the task.
    NotFound(usize),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StackError::Allocate(err) => {
                write!(f, "failed to allocate a stack segment: {}", err)
            }
            StackError::Exhausted { used, limit } => write!(
                f,
                "ran out of stack ({} bytes requested, limit is {} bytes)",
                used, limit
            ),
            StackError::Underflow => {
                write!(f, "can't pop the first stack segment")
            }
            StackError::NotFound(sp) => write!(
                f,
                "the stack pointer {:#x} isn't in any stack segment",
                sp
            ),
        }
    }
}

/// A chunk of memory used as stack memory.
///
/// The layout of the stack is as follows:
///
///     +--------------+ <- top
///     |              |
///     |     stack    | | stack growth direction
///     |              | v
///     +--------------+ <- bottom
///     |  guard page  |
///     +--------------+
///
/// The guard page turns overflows into a segmentation fault, instead of
/// silently corrupting whatever memory happens to be below the stack.
pub struct Stack {
    mem: MemoryMap,
}

impl Stack {
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let mut mem = MemoryMap::stack(size + page)?;

        mem.protect(0)?;
        Ok(Self { mem })
    }

    /// The lowest usable address of this stack.
    pub(crate) fn bottom(&self) -> usize {
        self.mem.ptr as usize + page_size()
    }

    /// The address just past the end of this stack, which is where the first
    /// frame starts.
    pub(crate) fn top(&self) -> usize {
        self.mem.ptr as usize + self.mem.len
    }

    /// The number of usable bytes.
    pub(crate) fn size(&self) -> usize {
        self.top() - self.bottom()
    }

    pub(crate) fn contains(&self, pointer: usize) -> bool {
        pointer > self.bottom() && pointer <= self.top()
    }

    /// The value generated code compares the stack pointer against before
    /// growing into a new segment.
    pub(crate) fn limit(&self) -> usize {
        self.bottom() + LIMIT_RESERVE
    }
}

/// The managed stack of a task, made up of one or more segments.
///
/// Segments that are popped are kept around so a task that repeatedly crosses
/// the same segment boundary (e.g. a loop calling a recursive function) doesn't
/// map and unmap memory every time.
pub struct Segments {
    segments: Vec<Stack>,

    /// The index of the segment the task is currently using.
    current: usize,

    /// The total number of usable bytes of all segments.
    total: usize,

    min_size: usize,
    max_size: usize,
}

impl Segments {
    pub(crate) fn new(config: &Config) -> Result<Self, StackError> {
        let first = Stack::new(config.min_stack_size + RED_ZONE_SIZE)
            .map_err(StackError::Allocate)?;

        Ok(Self {
            total: first.size(),
            segments: vec![first],
            current: 0,
            min_size: config.min_stack_size,
            max_size: config.max_stack_size,
        })
    }

    pub(crate) fn current(&self) -> &Stack {
        &self.segments[self.current]
    }

    pub(crate) fn first(&self) -> &Stack {
        &self.segments[0]
    }

    /// The depth of the current segment, starting at zero.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.current
    }

    /// The number of segments, including cached ones.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }

    #[cfg(test)]
    pub(crate) fn total_size(&self) -> usize {
        self.total
    }

    /// Moves to a segment of at least `size` bytes, then copies the argument
    /// block to its top.
    ///
    /// The return value is the (aligned) address the arguments are copied to,
    /// which is also the stack pointer to continue with.
    pub(crate) fn grow(
        &mut self,
        size: usize,
        arguments: *const u8,
        arguments_size: usize,
        unwinding: bool,
    ) -> Result<*mut u8, StackError> {
        let limit = self.limit(unwinding);
        let needed = size
            .checked_add(arguments_size)
            .ok_or(StackError::Exhausted { used: usize::MAX, limit })?;

        self.next_segment(needed, unwinding)?;

        let stack = self.current();
        let pointer = align_down(stack.top() - arguments_size) as *mut u8;

        if arguments_size > 0 {
            unsafe { copy_nonoverlapping(arguments, pointer, arguments_size) };
        }

        Ok(pointer)
    }

    /// Returns to the previous segment.
    pub(crate) fn shrink(&mut self) -> Result<(), StackError> {
        if self.current == 0 {
            return Err(StackError::Underflow);
        }

        self.current -= 1;
        Ok(())
    }

    /// Pops segments until the current one contains the given stack pointer.
    ///
    /// This is needed after unwinding, as landing pads may be in a frame that
    /// resides in an earlier segment.
    pub(crate) fn reset(&mut self, pointer: usize) -> Result<(), StackError> {
        while !self.current().contains(pointer) {
            if self.current == 0 {
                return Err(StackError::NotFound(pointer));
            }

            self.current -= 1;
        }

        Ok(())
    }

    fn next_segment(
        &mut self,
        needed: usize,
        unwinding: bool,
    ) -> Result<(), StackError> {
        let next = self.current + 1;

        while next < self.segments.len() {
            let size = self.segments[next].size() - RED_ZONE_SIZE;

            if self.min_size <= size && needed <= size {
                debug!("reusing stack segment {} ({} bytes)", next, size);
                self.current = next;
                return Ok(());
            }

            debug!("stack segment {} is too small, releasing it", next);

            let stack = self.segments.remove(next);

            self.total -= stack.size();
        }

        let size = self.next_size(needed);
        let limit = self.limit(unwinding);
        let used = self.total.saturating_add(size);

        if used > limit {
            return Err(StackError::Exhausted { used, limit });
        }

        let stack =
            Stack::new(size + RED_ZONE_SIZE).map_err(StackError::Allocate)?;

        debug!(
            "allocated stack segment {} ({} bytes, {:#x}-{:#x})",
            next,
            stack.size(),
            stack.bottom(),
            stack.top()
        );

        self.total += stack.size();
        self.segments.push(stack);
        self.current = next;
        Ok(())
    }

    /// Returns the amount of stack the task may use.
    fn limit(&self, unwinding: bool) -> usize {
        if unwinding {
            self.max_size.saturating_mul(2)
        } else {
            self.max_size
        }
    }

    fn next_size(&self, requested: usize) -> usize {
        let current = self.current().size() - RED_ZONE_SIZE;

        max(max(self.min_size, requested), min(MAX_SEGMENT_GROWTH, current * 2))
    }
}
