use crate::runtime::{c_string, fatal, required_task};
use crate::task::TaskPointer;
use std::ffi::c_char;

#[repr(C)]
pub(crate) struct FailArgs {
    task: TaskPointer,
    expression: *const c_char,
    file: *const c_char,
    line: usize,
}

unsafe extern "C-unwind" fn fail_on_foreign_stack(args: *mut u8) {
    let args = &*(args as *const FailArgs);

    upcall_entry!(args.task, "fail");
    args.task.fail(c_string(args.expression), c_string(args.file), args.line)
}

/// Fails the given task.
///
/// The task's failure handler decides what happens next. Either way, control
/// doesn't return to the caller.
pub(crate) unsafe fn fail(
    task: TaskPointer,
    expression: *const c_char,
    file: *const c_char,
    line: usize,
) -> ! {
    let mut args = FailArgs { task, expression, file, line };

    task.call_on_foreign_stack(
        &mut args as *mut FailArgs as *mut u8,
        fail_on_foreign_stack,
    );

    fatal(&format!(
        "the failure handler of task '{}' ({:#x}) returned",
        task.name,
        task.identifier()
    ))
}

#[no_mangle]
pub unsafe extern "C-unwind" fn upcall_fail(
    expression: *const c_char,
    file: *const c_char,
    line: usize,
) {
    fail(required_task("fail"), expression, file, line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UpcallWorker;
    use crate::task::{current, CurrentTask, Location, TaskFailure};
    use crate::test::{managed_task, new_task, RecordingHandler};
    use std::mem::size_of;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::ptr::addr_of;

    fn expected() -> TaskFailure {
        TaskFailure {
            expression: "x==y".to_string(),
            file: "foo.c".to_string(),
            line: 42,
        }
    }

    #[test]
    fn test_type_sizes() {
        assert_eq!(size_of::<FailArgs>(), 32);
    }

    #[test]
    fn test_field_offsets() {
        let task = new_task();
        let args = FailArgs {
            task: *task,
            expression: c"x".as_ptr(),
            file: c"y".as_ptr(),
            line: 1,
        };
        let base = addr_of!(args) as usize;

        assert_eq!(addr_of!(args.task) as usize - base, 0);
        assert_eq!(addr_of!(args.expression) as usize - base, 8);
        assert_eq!(addr_of!(args.file) as usize - base, 16);
        assert_eq!(addr_of!(args.line) as usize - base, 24);
    }

    #[test]
    fn test_fail() {
        let mut task = managed_task();
        let observed = RecordingHandler::install(&mut task);
        let res: Result<(), _> = catch_unwind(AssertUnwindSafe(|| unsafe {
            fail(*task, c"x==y".as_ptr(), c"foo.c".as_ptr(), 42)
        }));

        let payload = res.unwrap_err();
        let observed = observed.borrow();

        assert_eq!(payload.downcast_ref::<TaskFailure>(), Some(&expected()));
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].failure, expected());
        assert_eq!(observed[0].location, Location::Foreign);
        assert!(observed[0].on_foreign_stack);
        assert!(observed[0].is_current);

        assert_eq!(task.failure(), Some(&expected()));
        assert!(task.is_unwinding());
        assert_eq!(task.location(), Location::Managed);
        assert_eq!(task.switches(), 1);
        assert!(current().is_none());
    }

    #[test]
    fn test_fail_with_missing_strings() {
        let mut task = managed_task();
        let observed = RecordingHandler::install(&mut task);
        let res: Result<(), _> = catch_unwind(AssertUnwindSafe(|| unsafe {
            fail(*task, std::ptr::null(), std::ptr::null(), 0)
        }));

        assert!(res.is_err());
        assert_eq!(observed.borrow()[0].failure.expression, "<unknown>");
        assert_eq!(observed.borrow()[0].failure.file, "<unknown>");
    }

    #[test]
    fn test_upcall_fail() {
        let mut task = managed_task();
        let observed = RecordingHandler::install(&mut task);
        let _current = CurrentTask::enter(*task);
        let res: Result<(), _> = catch_unwind(AssertUnwindSafe(|| unsafe {
            upcall_fail(c"x==y".as_ptr(), c"foo.c".as_ptr(), 42)
        }));

        assert!(res.is_err());
        assert_eq!(observed.borrow()[0].failure, expected());
        assert_eq!(current(), Some(*task));
    }

    #[test]
    fn test_fail_unwinds_the_managed_stack() {
        unsafe extern "C-unwind" fn body(args: *mut u8) {
            let reached = &mut *(args as *mut bool);

            upcall_fail(c"x==y".as_ptr(), c"foo.c".as_ptr(), 42);
            *reached = true;
        }

        let mut task = new_task();
        let observed = RecordingHandler::install(&mut task);
        let mut reached = false;
        let res: Result<(), _> = catch_unwind(AssertUnwindSafe(|| unsafe {
            task.call_on_managed_stack(
                &mut reached as *mut bool as *mut u8,
                body as UpcallWorker,
            )
        }));

        assert_eq!(
            res.unwrap_err().downcast_ref::<TaskFailure>(),
            Some(&expected())
        );
        assert!(!reached);
        assert!(observed.borrow()[0].on_foreign_stack);
        assert_eq!(task.location(), Location::Foreign);
        assert_eq!(task.stack_limit, 0);
        assert_eq!(task.switches(), 2);
        assert!(current().is_none());
    }
}
