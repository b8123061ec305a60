use crate::task::{current, TaskPointer};
use crate::unwind::{
    missing_personality, platform_personality, set_platform_personality,
    PersonalityRoutine, UnwindAction, UnwindContext, UnwindException,
    UnwindReasonCode, URC_NO_REASON,
};
use std::ffi::c_int;

#[repr(C)]
pub(crate) struct PersonalityArgs {
    task: TaskPointer,
    retval: UnwindReasonCode,
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
    routine: PersonalityRoutine,
}

unsafe extern "C-unwind" fn personality_on_foreign_stack(args: *mut u8) {
    let args = &mut *(args as *mut PersonalityArgs);

    upcall_entry!(args.task, "personality");

    args.retval = (args.routine)(
        args.version,
        args.actions,
        args.exception_class,
        args.exception,
        args.context,
    );
}

/// Runs a personality routine on behalf of the given task.
///
/// The unwinder may call this while the task runs on either stack. The
/// routine itself always runs on the foreign stack, and its result is returned
/// as-is.
pub(crate) unsafe fn personality(
    task: Option<TaskPointer>,
    routine: PersonalityRoutine,
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode {
    let Some(task) = task else {
        return routine(version, actions, exception_class, exception, context);
    };

    let mut args = PersonalityArgs {
        task,
        retval: URC_NO_REASON,
        version,
        actions,
        exception_class,
        exception,
        context,
        routine,
    };

    task.call_on_foreign_stack(
        &mut args as *mut PersonalityArgs as *mut u8,
        personality_on_foreign_stack,
    );

    args.retval
}

/// The personality routine of generated code.
#[no_mangle]
pub unsafe extern "C" fn upcall_personality(
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode {
    match platform_personality() {
        Some(routine) => personality(
            current(),
            routine,
            version,
            actions,
            exception_class,
            exception,
            context,
        ),
        None => missing_personality(actions),
    }
}

/// Registers the personality routine to forward the unwinder's calls to.
///
/// Passing NULL removes the current routine.
#[no_mangle]
pub unsafe extern "C" fn upcall_set_personality(
    routine: Option<PersonalityRoutine>,
) {
    set_platform_personality(routine);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::stack_pointer;
    use crate::task::{CurrentTask, Location};
    use crate::test::{managed_task, new_task};
    use crate::unwind::{
        URC_CONTINUE_UNWIND, URC_FATAL_PHASE1_ERROR, URC_FATAL_PHASE2_ERROR,
        URC_HANDLER_FOUND, UA_CLEANUP_PHASE, UA_SEARCH_PHASE,
    };
    use std::cell::Cell;
    use std::mem::size_of;
    use std::ptr::{addr_of, null_mut};

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    struct Call {
        location: Option<Location>,
        on_foreign_stack: bool,
        actions: UnwindAction,
        exception_class: u64,
    }

    thread_local! {
        static CALL: Cell<Option<Call>> = const { Cell::new(None) };
    }

    unsafe extern "C" fn fake_personality(
        _version: c_int,
        actions: UnwindAction,
        exception_class: u64,
        _exception: *mut UnwindException,
        _context: *mut UnwindContext,
    ) -> UnwindReasonCode {
        let task = current();

        CALL.set(Some(Call {
            location: task.map(|t| t.location()),
            on_foreign_stack: task
                .map_or(false, |t| t.foreign.contains(stack_pointer())),
            actions,
            exception_class,
        }));

        if actions & UA_SEARCH_PHASE != 0 {
            URC_HANDLER_FOUND
        } else {
            URC_CONTINUE_UNWIND
        }
    }

    unsafe fn route(task: Option<TaskPointer>, actions: UnwindAction) -> c_int {
        personality(
            task,
            fake_personality,
            1,
            actions,
            0x52555354,
            null_mut(),
            null_mut(),
        )
    }

    #[test]
    fn test_type_sizes() {
        assert_eq!(size_of::<PersonalityArgs>(), 56);
    }

    #[test]
    fn test_field_offsets() {
        let task = new_task();
        let args = PersonalityArgs {
            task: *task,
            retval: 0,
            version: 1,
            actions: 0,
            exception_class: 0,
            exception: null_mut(),
            context: null_mut(),
            routine: fake_personality,
        };
        let base = addr_of!(args) as usize;

        assert_eq!(addr_of!(args.task) as usize - base, 0);
        assert_eq!(addr_of!(args.retval) as usize - base, 8);
        assert_eq!(addr_of!(args.version) as usize - base, 12);
        assert_eq!(addr_of!(args.actions) as usize - base, 16);
        assert_eq!(addr_of!(args.exception_class) as usize - base, 24);
        assert_eq!(addr_of!(args.exception) as usize - base, 32);
        assert_eq!(addr_of!(args.context) as usize - base, 40);
        assert_eq!(addr_of!(args.routine) as usize - base, 48);
    }

    #[test]
    fn test_personality_on_managed_stack() {
        let task = managed_task();
        let _current = CurrentTask::enter(*task);
        let code = unsafe { route(Some(*task), UA_SEARCH_PHASE) };
        let call = CALL.get().unwrap();

        assert_eq!(code, URC_HANDLER_FOUND);
        assert_eq!(call.location, Some(Location::Foreign));
        assert!(call.on_foreign_stack);
        assert_eq!(call.actions, UA_SEARCH_PHASE);
        assert_eq!(call.exception_class, 0x52555354);
        assert_eq!(task.switches(), 1);
        assert_eq!(task.location(), Location::Managed);
        assert_eq!(current(), Some(*task));
    }

    #[test]
    fn test_personality_on_foreign_stack() {
        let task = new_task();
        let _current = CurrentTask::enter(*task);
        let code = unsafe { route(Some(*task), UA_SEARCH_PHASE) };
        let call = CALL.get().unwrap();

        assert_eq!(code, URC_HANDLER_FOUND);
        assert_eq!(call.location, Some(Location::Foreign));
        assert_eq!(task.switches(), 0);
    }

    #[test]
    fn test_personality_result_is_independent_of_location() {
        let managed = managed_task();
        let foreign = new_task();

        for actions in [UA_SEARCH_PHASE, UA_CLEANUP_PHASE] {
            let via_switch = unsafe { route(Some(*managed), actions) };
            let direct = unsafe { route(Some(*foreign), actions) };

            assert_eq!(via_switch, direct);
        }

        assert_eq!(managed.switches(), 2);
        assert_eq!(foreign.switches(), 0);
    }

    #[test]
    fn test_personality_without_task() {
        let code = unsafe { route(None, UA_CLEANUP_PHASE) };
        let call = CALL.get().unwrap();

        assert_eq!(code, URC_CONTINUE_UNWIND);
        assert_eq!(call.location, None);
        assert_eq!(call.actions, UA_CLEANUP_PHASE);
    }

    // This is the only test that changes the registered routine, as it's
    // shared by all threads.
    #[test]
    fn test_upcall_personality() {
        unsafe {
            upcall_set_personality(None);

            assert_eq!(
                upcall_personality(
                    1,
                    UA_SEARCH_PHASE,
                    0,
                    null_mut(),
                    null_mut()
                ),
                URC_FATAL_PHASE1_ERROR
            );
            assert_eq!(
                upcall_personality(
                    1,
                    UA_CLEANUP_PHASE,
                    0,
                    null_mut(),
                    null_mut()
                ),
                URC_FATAL_PHASE2_ERROR
            );

            upcall_set_personality(Some(fake_personality));

            let task = managed_task();
            let _current = CurrentTask::enter(*task);
            let code = upcall_personality(
                1,
                UA_SEARCH_PHASE,
                0,
                null_mut(),
                null_mut(),
            );

            upcall_set_personality(None);

            assert_eq!(code, URC_HANDLER_FOUND);
            assert_eq!(task.switches(), 1);
            assert_eq!(CALL.get().unwrap().location, Some(Location::Foreign));
        }
    }
}
