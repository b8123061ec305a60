use crate::mem::{OpaqueBox, TypeDesc};
use crate::runtime::{fatal, required_task};
use crate::task::TaskPointer;
use log::debug;
use std::ptr::null_mut;

#[repr(C)]
pub(crate) struct MallocArgs {
    task: TaskPointer,
    retval: *mut OpaqueBox,
    type_desc: *const TypeDesc,
    size: usize,
}

#[repr(C)]
pub(crate) struct FreeArgs {
    task: TaskPointer,
    ptr: *mut OpaqueBox,
}

unsafe extern "C-unwind" fn malloc_on_foreign_stack(args: *mut u8) {
    let args = &mut *(args as *mut MallocArgs);
    let mut task = args.task;

    upcall_entry!(task, "malloc");
    debug!("upcall malloc({:#x})", args.type_desc as usize);

    if args.type_desc.is_null() {
        fatal(&format!(
            "task '{}' ({:#x}) can't allocate a box without a type descriptor",
            task.name,
            task.identifier()
        ));
    }

    let boxed = match task.boxed.malloc(args.type_desc, args.size) {
        Ok(boxed) => boxed,
        Err(err) => fatal(&format!(
            "task '{}' ({:#x}) can't allocate a box: {}",
            task.name,
            task.identifier(),
            err
        )),
    };

    if let Some(origins) = task.origins.as_mut() {
        origins.track(boxed);
    }

    debug!(
        "upcall malloc({:#x}) = box {:#x} with body {:#x}",
        args.type_desc as usize,
        boxed as usize,
        OpaqueBox::body(boxed) as usize
    );

    args.retval = boxed;
}

unsafe extern "C-unwind" fn free_on_foreign_stack(args: *mut u8) {
    let args = &*(args as *const FreeArgs);
    let mut task = args.task;

    upcall_entry!(task, "free");
    debug!("upcall free({:#x})", args.ptr as usize);

    if let Some(origins) = task.origins.as_mut() {
        origins.untrack(args.ptr);
    }

    if let Err(err) = task.boxed.free(args.ptr) {
        fatal(&format!(
            "task '{}' ({:#x}) can't free a box: {}",
            task.name,
            task.identifier(),
            err
        ));
    }
}

/// Allocates a box in the heap of the given task.
pub(crate) unsafe fn malloc(
    task: TaskPointer,
    type_desc: *const TypeDesc,
    size: usize,
) -> *mut OpaqueBox {
    let mut args = MallocArgs { task, retval: null_mut(), type_desc, size };

    task.call_on_foreign_stack(
        &mut args as *mut MallocArgs as *mut u8,
        malloc_on_foreign_stack,
    );

    args.retval
}

/// Releases a box allocated in the heap of the given task.
pub(crate) unsafe fn free(task: TaskPointer, ptr: *mut OpaqueBox) {
    let mut args = FreeArgs { task, ptr };

    task.call_on_foreign_stack(
        &mut args as *mut FreeArgs as *mut u8,
        free_on_foreign_stack,
    );
}

#[no_mangle]
pub unsafe extern "C" fn upcall_malloc(
    type_desc: *const TypeDesc,
    size: usize,
) -> *mut OpaqueBox {
    malloc(required_task("malloc"), type_desc, size)
}

#[no_mangle]
pub unsafe extern "C" fn upcall_free(ptr: *mut OpaqueBox) {
    free(required_task("free"), ptr)
}
