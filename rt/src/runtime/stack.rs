//! Upcalls for managing the segments of the managed stack.
//!
//! These upcalls run directly on the managed stack. The prologue of a function
//! calls `upcall_new_stack` when the stack pointer is about to cross the stack
//! limit, so they're called far too often to switch stacks.
use crate::runtime::{fatal, required_task};
use crate::stack::StackError;
use crate::task::TaskPointer;

fn stack_error(task: TaskPointer, action: &str, error: StackError) -> ! {
    fatal(&format!(
        "task '{}' ({:#x}) can't {}: {}",
        task.name,
        task.identifier(),
        action,
        error
    ))
}

pub(crate) unsafe fn new_stack(
    mut task: TaskPointer,
    size: usize,
    args: *const u8,
    args_size: usize,
) -> *mut u8 {
    match task.grow_stack(size, args, args_size) {
        Ok(pointer) => pointer,
        Err(err) => stack_error(task, "grow its stack", err),
    }
}

pub(crate) fn del_stack(mut task: TaskPointer) {
    if let Err(err) = task.shrink_stack() {
        stack_error(task, "shrink its stack", err);
    }
}

#[inline(always)]
pub(crate) fn reset_stack_limit(mut task: TaskPointer) {
    if let Err(err) = task.reset_stack_limit() {
        stack_error(task, "reset its stack limit", err);
    }
}

/// Moves the current task to a stack segment of at least `size` bytes.
///
/// The `args_size` bytes at `args` are copied to the new segment, and the
/// address of the copy is returned.
#[no_mangle]
pub unsafe extern "C" fn upcall_new_stack(
    size: usize,
    args: *const u8,
    args_size: usize,
) -> *mut u8 {
    new_stack(required_task("new_stack"), size, args, args_size)
}

#[no_mangle]
pub unsafe extern "C" fn upcall_del_stack() {
    del_stack(required_task("del_stack"))
}

/// Recomputes the stack limit of the current task.
///
/// Landing pads call this after unwinding, as the unwinder may have moved the
/// stack pointer to an earlier segment.
#[no_mangle]
pub unsafe extern "C" fn upcall_reset_stack_limit() {
    reset_stack_limit(required_task("reset_stack_limit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UpcallWorker;
    use crate::task::{current, CurrentTask, Location};
    use crate::test::{managed_task, new_task};
    use std::slice;

    #[test]
    fn test_new_stack() {
        let task = managed_task();
        let args = [1_u8, 2, 3, 4, 5, 6, 7, 8];
        let first_limit = task.segments.first().limit();
        let pointer =
            unsafe { new_stack(*task, 1024, args.as_ptr(), args.len()) };

        assert_eq!(task.switches(), 0);
        assert_eq!(task.segments.depth(), 1);
        assert!(task.segments.current().contains(pointer as usize));
        assert_eq!(pointer as usize % 16, 0);
        assert_eq!(unsafe { slice::from_raw_parts(pointer, 8) }, &args);
        assert_eq!(task.stack_limit, task.segments.current().limit());
        assert_ne!(task.stack_limit, first_limit);
    }

    #[test]
    fn test_del_stack() {
        let task = managed_task();

        unsafe {
            new_stack(*task, 1024, [0_u8; 0].as_ptr(), 0);
        }

        del_stack(*task);

        assert_eq!(task.switches(), 0);
        assert_eq!(task.segments.depth(), 0);
        assert_eq!(task.segments.len(), 2);
        assert_eq!(task.stack_limit, task.segments.first().limit());
    }

    #[test]
    fn test_upcall_new_and_del_stack() {
        let task = managed_task();
        let _current = CurrentTask::enter(*task);
        let args = 42_u64.to_ne_bytes();

        unsafe {
            let pointer = upcall_new_stack(4096, args.as_ptr(), args.len());

            assert_eq!(*(pointer as *const u64), 42);
            assert_eq!(task.segments.depth(), 1);

            upcall_del_stack();
        }

        assert_eq!(task.segments.depth(), 0);
        assert_eq!(task.switches(), 0);
        assert_eq!(current(), Some(*task));
    }

    #[repr(C)]
    struct ResetArgs {
        task: TaskPointer,
        depth: usize,
        limit: usize,
    }

    #[test]
    fn test_reset_stack_limit() {
        unsafe extern "C-unwind" fn body(args: *mut u8) {
            let args = &mut *(args as *mut ResetArgs);
            let empty = [0_u8; 0];

            new_stack(args.task, 1024, empty.as_ptr(), 0);
            new_stack(args.task, 1024, empty.as_ptr(), 0);
            upcall_reset_stack_limit();

            args.depth = args.task.segments.depth();
            args.limit = args.task.stack_limit;
        }

        let task = new_task();
        let mut args = ResetArgs { task: *task, depth: 0, limit: 0 };

        unsafe {
            task.call_on_managed_stack(
                &mut args as *mut ResetArgs as *mut u8,
                body as UpcallWorker,
            );
        }

        assert_eq!(args.depth, 0);
        assert_eq!(args.limit, task.segments.first().limit());
        assert_eq!(task.segments.len(), 3);
        assert_eq!(task.switches(), 1);
        assert_eq!(task.location(), Location::Foreign);
        assert_eq!(task.stack_limit, 0);
    }
}
