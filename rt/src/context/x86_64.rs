use std::arch::asm;

// RDI: the argument to pass to the function, left as-is
// RSI: the function to call
// RDX: the stack pointer to call the function with
// RCX: the address to store the stack pointer of the caller in
//
// The old stack pointer is kept in RBP, which is callee-saved. The stack
// pointer stored through RCX is the lowest address in use on the old stack, so
// a nested switch back to that stack starts below all of our frames. The CFI
// directives allow unwinders and backtraces to walk from the new stack back
// into the old one.
asm_func!(
    "upcall_context_call",
    "
    .cfi_startproc
    push rbp
    .cfi_def_cfa_offset 16
    .cfi_offset rbp, -16
    mov rbp, rsp
    .cfi_def_cfa_register rbp
    mov [rcx], rsp
    mov rsp, rdx
    call rsi
    mov rsp, rbp
    pop rbp
    .cfi_def_cfa rsp, 8
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
            "mov {}, rsp",
            out(reg) pointer,
            options(nomem, nostack, preserves_flags)
        );
    }

    pointer
}
