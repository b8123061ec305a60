#![allow(clippy::new_without_default)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]

mod macros;

mod config;
mod context;
mod mem;
mod memory_map;
mod origin;
mod runtime;
mod stack;
mod task;
mod unwind;


pub use config::Config;
pub use context::UpcallWorker;
pub use mem::{AllocError, FreeError, OpaqueBox, TypeDesc};
pub use runtime::{
    upcall_call_shim_on_foreign_stack, upcall_call_shim_on_managed_stack,
    upcall_del_stack, upcall_fail, upcall_free, upcall_malloc,
    upcall_new_stack, upcall_personality, upcall_reset_stack_limit,
    upcall_set_personality,
};
pub use stack::StackError;
pub use task::{
    current, AbortOnFailure, CurrentTask, FailureHandler, Location, Task,
    TaskFailure, TaskPointer, UnwindOnFailure,
};
pub use unwind::{
    missing_personality, platform_personality, set_platform_personality,
    PersonalityRoutine, UnwindAction, UnwindContext, UnwindException,
    UnwindReasonCode, UA_CLEANUP_PHASE, UA_END_OF_STACK, UA_FORCE_UNWIND,
    UA_HANDLER_FRAME, UA_SEARCH_PHASE, URC_CONTINUE_UNWIND,
    URC_END_OF_STACK, URC_FATAL_PHASE1_ERROR, URC_FATAL_PHASE2_ERROR,
    URC_FOREIGN_EXCEPTION_CAUGHT, URC_HANDLER_FOUND, URC_INSTALL_CONTEXT,
    URC_NORMAL_STOP, URC_NO_REASON,
};
