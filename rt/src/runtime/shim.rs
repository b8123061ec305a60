use crate::context::UpcallWorker;
use crate::task::current;

/// Calls a foreign function on the foreign stack of the current task.
///
/// Without a current task (e.g. while the program starts up) the function is
/// called on the current stack.
#[no_mangle]
pub unsafe extern "C-unwind" fn upcall_call_shim_on_foreign_stack(
    args: *mut u8,
    func: UpcallWorker,
) {
    match current() {
        Some(task) => task.call_on_foreign_stack(args, func),
        None => func(args),
    }
}

/// Calls a managed function (e.g. a callback passed to foreign code) on the
/// managed stack of the current task.
#[no_mangle]
pub unsafe extern "C-unwind" fn upcall_call_shim_on_managed_stack(
    args: *mut u8,
    func: UpcallWorker,
) {
    match current() {
        Some(task) => task.call_on_managed_stack(args, func),
        None => func(args),
    }
}
