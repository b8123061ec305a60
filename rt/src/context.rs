//! Running functions on a different stack.
//!
//! Switching stacks is implemented using a single function:
//! `upcall_context_call`. This function saves the current stack pointer, moves
//! to the given stack, calls a function, then restores the stack pointer and
//! returns. Before moving to the new stack it also writes the stack pointer to
//! a slot provided by the caller, which is where a nested switch back to the
//! old stack must start. The switch is synchronous: there's no suspended context to resume
//! at a later point, meaning nesting switches is just a matter of calling this
//! function again on the other side.
//!
//! Unwinding through `upcall_context_call` isn't supported. Instead, `switch`
//! runs the function under `catch_unwind` on the new stack, and hands the
//! payload back to the caller once we're back on the original stack. It's up
//! to the caller to decide what to do with it.
#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stack switching is only supported on x86_64 and aarch64");

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::stack_pointer;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::stack_pointer;

/// The signature of a function to run on another stack.
pub(crate) type StackFunction = unsafe extern "C" fn(*mut u8);

// This function is defined in the inline assembly found in modules such as
// context/x86_64.rs.
extern "C" {
    fn upcall_context_call(
        data: *mut u8,
        func: StackFunction,
        stack: usize,
        saved: *mut usize,
    );
}

/// The signature of the functions generated code runs on another stack.
///
/// These functions take a single argument: a pointer to a record containing the
/// actual arguments, along with a field to write the result to (if any).
pub type UpcallWorker = unsafe extern "C-unwind" fn(*mut u8);

/// The payload of an unwind caught on the other side of a switch.
pub(crate) type Unwind = Box<dyn Any + Send + 'static>;

struct Switch {
    func: UpcallWorker,
    args: *mut u8,
    unwind: Option<Unwind>,
}

unsafe extern "C" fn switch_entry(data: *mut u8) {
    let switch = &mut *(data as *mut Switch);
    let func = switch.func;
    let args = switch.args;

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| func(args))) {
        switch.unwind = Some(payload);
    }
}

/// Runs `func` on the given stack, returning an error if it unwinds.
///
/// The stack pointer of the caller at the time of the switch is written to
/// `saved`.
pub(crate) unsafe fn switch(
    stack: usize,
    func: UpcallWorker,
    args: *mut u8,
    saved: *mut usize,
) -> Result<(), Unwind> {
    let mut switch = Switch { func, args, unwind: None };

    call_with_stack(
        stack,
        switch_entry,
        &mut switch as *mut Switch as *mut u8,
        saved,
    );

    match switch.unwind {
        Some(payload) => Err(payload),
        None => Ok(()),
    }
}

/// Calls `func` with `data` as its argument, using `stack` as the stack
/// pointer.
///
/// The stack pointer must be aligned to 16 bytes, and there must be enough
/// space below it for `func` to run.
#[inline(always)]
pub(crate) unsafe fn call_with_stack(
    stack: usize,
    func: StackFunction,
    data: *mut u8,
    saved: *mut usize,
) {
    upcall_context_call(data, func, stack, saved);
}
