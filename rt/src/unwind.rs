//! Types of the platform's unwinder ABI.
//!
//! The unwinder calls a personality routine for every frame it passes
//! through. Generated code uses `upcall_personality` as its personality
//! routine, which forwards the call to the routine of the platform. That
//! routine is registered by the program embedding the runtime, as it depends
//! on the toolchain used to link the program.
use crossbeam_utils::atomic::AtomicCell;
use std::ffi::c_int;

pub type UnwindReasonCode = c_int;
pub type UnwindAction = c_int;

pub const URC_NO_REASON: UnwindReasonCode = 0;
pub const URC_FOREIGN_EXCEPTION_CAUGHT: UnwindReasonCode = 1;
pub const URC_FATAL_PHASE2_ERROR: UnwindReasonCode = 2;
pub const URC_FATAL_PHASE1_ERROR: UnwindReasonCode = 3;
pub const URC_NORMAL_STOP: UnwindReasonCode = 4;
pub const URC_END_OF_STACK: UnwindReasonCode = 5;
pub const URC_HANDLER_FOUND: UnwindReasonCode = 6;
pub const URC_INSTALL_CONTEXT: UnwindReasonCode = 7;
pub const URC_CONTINUE_UNWIND: UnwindReasonCode = 8;

pub const UA_SEARCH_PHASE: UnwindAction = 1;
pub const UA_CLEANUP_PHASE: UnwindAction = 2;
pub const UA_HANDLER_FRAME: UnwindAction = 4;
pub const UA_FORCE_UNWIND: UnwindAction = 8;
pub const UA_END_OF_STACK: UnwindAction = 16;

/// An exception object, owned by the unwinder.
#[repr(C)]
pub struct UnwindException {
    _private: [u8; 0],
}

/// The unwinder's state for the frame being unwound.
#[repr(C)]
pub struct UnwindContext {
    _private: [u8; 0],
}

pub type PersonalityRoutine = unsafe extern "C" fn(
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode;

static PLATFORM_PERSONALITY: AtomicCell<Option<PersonalityRoutine>> =
    AtomicCell::new(None);

/// Registers the personality routine of the platform, replacing the previous
/// one (if any).
pub fn set_platform_personality(routine: Option<PersonalityRoutine>) {
    PLATFORM_PERSONALITY.store(routine);
}

pub fn platform_personality() -> Option<PersonalityRoutine> {
    PLATFORM_PERSONALITY.load()
}

/// Returns the reason code to use when no personality routine is registered.
///
/// Without a routine we can't tell anything about a frame, so the unwind is
/// aborted with the error matching the phase it's in.
pub fn missing_personality(actions: UnwindAction) -> UnwindReasonCode {
    if actions & UA_SEARCH_PHASE != 0 {
        URC_FATAL_PHASE1_ERROR
    } else {
        URC_FATAL_PHASE2_ERROR
    }
}
