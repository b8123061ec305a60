use std::arch::asm;

// X0: the argument to pass to the function, left as-is
// X1: the function to call
// X2: the stack pointer to call the function with
// X3: the address to store the stack pointer of the caller in
//
// The old stack pointer is kept in the frame pointer (X29), which is
// callee-saved.
asm_func!(
    "upcall_context_call",
    "
    .cfi_startproc
    stp x29, x30, [sp, -16]!
    .cfi_def_cfa_offset 16
    .cfi_offset x30, -8
    .cfi_offset x29, -16
    mov x29, sp
    .cfi_def_cfa_register x29
    mov x9, sp
    str x9, [x3]
    mov sp, x2
    blr x1
    mov sp, x29
    .cfi_def_cfa sp, 16
    ldp x29, x30, [sp], 16
    .cfi_def_cfa_offset 0
    .cfi_restore x30
    .cfi_restore x29
    ret
    .cfi_endproc
    "
);

/// Returns the current value of the stack pointer register.
#[inline(always)]
pub(crate) fn stack_pointer() -> usize {
    let pointer: usize;

    unsafe {
        asm!(
            "mov {}, sp",
            out(reg) pointer,
            options(nomem, nostack, preserves_flags)
        );
    }

    pointer
}
