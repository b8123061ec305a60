#![macro_use]

/// A macro for initialising a struct field, without dropping the existing
/// value.
///
/// Boxes are allocated before their headers are written. A regular field
/// assignment would drop the existing (uninitialised) field value.
///
/// # Examples
///
///     init!(header.ref_count => 1);
macro_rules! init {
    ($field: expr => $value: expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            std::ptr::addr_of_mut!($field).write($value);
        }
    };
}

/// Logs the entry of an upcall worker, after the switch to the foreign stack.
macro_rules! upcall_entry {
    ($task: expr, $name: expr) => {
        log::trace!(
            "> UPCALL {} - task: {} {:#x}",
            $name,
            $task.name,
            $task.identifier()
        );

        #[cfg(test)]
        crate::test::record_entry($name, $task);
    };
}

#[cfg(target_os = "macos")]
macro_rules! asm_func {
    ($name: expr, $($body: tt)*) => {
        std::arch::global_asm!(concat!(
            ".text\n",
            ".global _", $name, "\n",
            ".p2align 4\n",
            "_", $name, ":\n",
            $($body)*
        ));
    }
}

#[cfg(not(target_os = "macos"))]
macro_rules! asm_func {
    ($name: expr, $($body: tt)*) => {
        std::arch::global_asm!(concat!(
            ".text\n",
            ".global ", $name, "\n",
            ".p2align 4\n",
            $name, ":\n",
            $($body)*
        ));
    }
}
