//! The upcalls generated code depends on.
//!
//! Upcalls are called on the managed stack of a task. Most of them immediately
//! switch to the foreign stack: they build a record containing the task, the
//! arguments and (if needed) a field for the result, then run a worker function
//! on the foreign stack that reads and writes this record. The exceptions are
//! the stack segment upcalls, which are called too often for the cost of a
//! stack switch to be acceptable.
//!
//! The layout of the argument records and the signatures of the upcalls are
//! fixed, as the compiler generates code that depends on them.
mod fail;
mod heap;
mod personality;
mod shim;
mod stack;

use crate::task::{current, TaskPointer};
use log::error;
use std::ffi::{c_char, CStr};
use std::io::{stderr, Write as _};
use std::process::abort;

pub use fail::upcall_fail;
pub use heap::{upcall_free, upcall_malloc};
pub use personality::{upcall_personality, upcall_set_personality};
pub use shim::{
    upcall_call_shim_on_foreign_stack, upcall_call_shim_on_managed_stack,
};
pub use stack::{upcall_del_stack, upcall_new_stack, upcall_reset_stack_limit};

/// Terminates the program in response to an error we can't recover from.
///
/// Such errors typically indicate a bug in either the runtime or the generated
/// code. Since the state of the program may be corrupt at this point, we keep
/// things as simple as possible.
#[inline(never)]
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    error!("{}", message);

    // Logging isn't reliable here (e.g. the program may not have set up a
    // logger), so the message is also written to STDERR directly.
    let _ = writeln!(stderr().lock(), "fatal runtime error: {}", message);

    abort();
}

/// Returns the current task, terminating the program if there isn't any.
pub(crate) fn required_task(upcall: &str) -> TaskPointer {
    match current() {
        Some(task) => task,
        None => fatal(&format!("upcall_{} requires a running task", upcall)),
    }
}

pub(crate) unsafe fn c_string(pointer: *const c_char) -> String {
    if pointer.is_null() {
        return "<unknown>".to_string();
    }

    CStr::from_ptr(pointer).to_string_lossy().into_owned()
}
