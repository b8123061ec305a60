//! Lightweight tasks and switching between their stacks.
//!
//! A task alternates between two stacks: a managed stack that generated code
//! runs on, and a foreign stack used for the runtime and foreign function
//! calls. The managed stack is made up of segments that grow and shrink as
//! needed, while the foreign stack is a single fixed-size stack.
//!
//! A task is on exactly one of these stacks at any given time. Switching is
//! done by calling a function on the other stack: once that function returns,
//! we're back on the stack we started on.
use crate::config::Config;
use crate::context::{self, stack_pointer, Unwind, UpcallWorker};
use crate::mem::BoxedRegion;
use crate::origin::OriginTracker;
use crate::runtime::fatal;
use crate::stack::{sanitize_stack_pointer, Segments, Stack, StackError};
use log::{error, warn};
use std::cell::Cell;
use std::fmt;
use std::mem::replace;
use std::ops::{Deref, DerefMut};
use std::panic::resume_unwind;
use std::ptr::NonNull;

thread_local! {
    /// The task running on the current thread.
    static CURRENT: Cell<Option<TaskPointer>> = const { Cell::new(None) };
}

/// Returns the task running on the current thread, if any.
pub fn current() -> Option<TaskPointer> {
    CURRENT.with(|current| current.get())
}

/// A guard that makes a task the current task of the calling thread.
///
/// When the guard is dropped, the previous current task (if any) is restored.
/// Schedulers use this when running a task, and every stack switch uses it to
/// ensure each nesting level observes the same current task.
pub struct CurrentTask {
    previous: Option<TaskPointer>,
}

impl CurrentTask {
    pub fn enter(task: TaskPointer) -> CurrentTask {
        let previous = CURRENT.with(|current| current.replace(Some(task)));

        CurrentTask { previous }
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

/// The stack a task is running on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Location {
    Managed,
    Foreign,
}

/// The details of a task failure.
///
/// This type is also the payload used when unwinding a failed task.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TaskFailure {
    pub expression: String,
    pub file: String,
    pub line: usize,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}', {}:{}", self.expression, self.file, self.line)
    }
}

/// A type that decides what happens when a task fails.
pub trait FailureHandler {
    fn fail(&mut self, task: TaskPointer, failure: TaskFailure) -> !;
}

/// Fails a task by unwinding its stacks, leaving it to the scheduler to catch
/// the failure.
pub struct UnwindOnFailure;

impl FailureHandler for UnwindOnFailure {
    fn fail(&mut self, _task: TaskPointer, failure: TaskFailure) -> ! {
        resume_unwind(Box::new(failure))
    }
}

/// Terminates the program when a task fails.
pub struct AbortOnFailure;

impl FailureHandler for AbortOnFailure {
    fn fail(&mut self, task: TaskPointer, failure: TaskFailure) -> ! {
        fatal(&format!(
            "task '{}' ({:#x}) failed at {}",
            task.name,
            task.identifier(),
            failure
        ))
    }
}

/// A failure handler taken out of its task while it runs.
///
/// The handler is given back to the task when it unwinds, unless the task
/// received a new handler in the meantime.
struct ActiveHandler {
    task: TaskPointer,
    handler: Box<dyn FailureHandler>,
}

impl Drop for ActiveHandler {
    fn drop(&mut self) {
        let handler = replace(&mut self.handler, Box::new(UnwindOnFailure));

        self.task.failure_handler.get_or_insert(handler);
    }
}

fn unwind_message(payload: &Unwind) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown exception"
    }
}

/// A lightweight task.
#[repr(C)]
pub struct Task {
    /// The stack limit the prologue of generated functions compares the stack
    /// pointer against.
    ///
    /// This field must stay the first field, as generated code reads it
    /// directly. While the task runs on its foreign stack this value is zero,
    /// as foreign code never grows the stack.
    pub stack_limit: usize,

    /// The stack the task is currently running on.
    pub(crate) location: Location,

    /// A flag indicating the task failed and is unwinding.
    pub(crate) unwinding: bool,

    pub(crate) name: String,

    /// The stack pointer to use for the next switch to the foreign stack.
    next_foreign_sp: usize,

    /// The stack pointer to use for the next switch to the managed stack.
    next_managed_sp: usize,

    pub(crate) foreign: Stack,
    pub(crate) segments: Segments,

    /// The heap for boxes allocated by generated code.
    pub(crate) boxed: BoxedRegion,

    /// The origins of the boxes in the task-local heap, if enabled.
    pub(crate) origins: Option<OriginTracker>,

    /// The handler to call when the task fails.
    ///
    /// This is `None` while the handler runs.
    failure_handler: Option<Box<dyn FailureHandler>>,
    failure: Option<TaskFailure>,

    /// The number of times we switched stacks.
    switches: u64,
}

impl Task {
    pub fn alloc(name: String, config: &Config) -> Result<TaskPointer, StackError> {
        let foreign = Stack::new(config.foreign_stack_size)
            .map_err(StackError::Allocate)?;
        let segments = Segments::new(config)?;
        let failure_handler: Box<dyn FailureHandler> =
            if config.abort_on_failure {
                Box::new(AbortOnFailure)
            } else {
                Box::new(UnwindOnFailure)
            };

        let task = Box::new(Task {
            stack_limit: 0,
            location: Location::Foreign,
            unwinding: false,
            name,
            next_foreign_sp: foreign.top(),
            next_managed_sp: segments.first().top(),
            foreign,
            segments,
            boxed: BoxedRegion::new(),
            origins: config.track_origins.then(OriginTracker::new),
            failure_handler: Some(failure_handler),
            failure: None,
            switches: 0,
        });

        Ok(unsafe { TaskPointer::new(Box::into_raw(task)) })
    }

    pub fn drop_and_deallocate(ptr: TaskPointer) {
        unsafe {
            drop(Box::from_raw(ptr.0.as_ptr()));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn on_managed_stack(&self) -> bool {
        self.location == Location::Managed
    }

    pub fn is_unwinding(&self) -> bool {
        self.unwinding
    }

    /// Returns the failure of this task, if it failed.
    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    /// Replaces the failure handler of this task.
    ///
    /// When called by the handler that's currently running, the new handler
    /// is used for the next failure.
    pub fn set_failure_handler(&mut self, handler: Box<dyn FailureHandler>) {
        self.failure_handler = Some(handler);
    }

    /// Returns the number of stack switches performed for this task.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Returns the number of boxes in the task-local heap.
    pub fn live_boxes(&self) -> usize {
        self.boxed.len()
    }

    /// Moves to a new managed stack segment of at least `size` bytes, copying
    /// the arguments to it.
    ///
    /// This is called when a function doesn't have enough stack space left, so
    /// it's called often and must not switch stacks.
    pub(crate) fn grow_stack(
        &mut self,
        size: usize,
        arguments: *const u8,
        arguments_size: usize,
    ) -> Result<*mut u8, StackError> {
        let ptr =
            self.segments.grow(size, arguments, arguments_size, self.unwinding)?;

        self.record_stack_limit();
        Ok(ptr)
    }

    /// Returns to the previous managed stack segment.
    pub(crate) fn shrink_stack(&mut self) -> Result<(), StackError> {
        self.segments.shrink()?;
        self.record_stack_limit();
        Ok(())
    }

    /// Recomputes the stack limit from the stack pointer.
    ///
    /// This must be called while running on the managed stack.
    #[inline(always)]
    pub(crate) fn reset_stack_limit(&mut self) -> Result<(), StackError> {
        self.segments.reset(stack_pointer())?;
        self.record_stack_limit();
        Ok(())
    }

    fn record_stack_limit(&mut self) {
        self.stack_limit = self.segments.current().limit();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let Some(origins) = self.origins.as_mut() else { return };

        for boxed in origins.tracked() {
            if let Some(origin) = origins.origin(boxed) {
                warn!(
                    "task '{}' leaked the box {:#x}, allocated at:\n{}",
                    self.name, boxed as usize, origin
                );
            }
        }
    }
}

/// A pointer to a task.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TaskPointer(NonNull<Task>);

unsafe impl Send for TaskPointer {}

impl TaskPointer {
    pub(crate) unsafe fn new(pointer: *mut Task) -> Self {
        Self(NonNull::new_unchecked(pointer))
    }

    pub(crate) fn identifier(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Runs `func` on the foreign stack.
    ///
    /// If the task already runs on its foreign stack, the function is called
    /// directly.
    pub(crate) unsafe fn call_on_foreign_stack(
        mut self,
        args: *mut u8,
        func: UpcallWorker,
    ) {
        if self.location == Location::Foreign {
            return func(args);
        }

        // Foreign code doesn't grow the stack, and the shims generated for it
        // do check the limit, so we disable the check until we come back.
        self.stack_limit = 0;

        let managed_sp = self.next_managed_sp;
        let stack = sanitize_stack_pointer(self.next_foreign_sp);
        let saved = &mut self.next_managed_sp as *mut usize;

        self.location = Location::Foreign;

        let result = self.switch(stack, args, func, saved);

        self.location = Location::Managed;
        self.next_managed_sp = managed_sp;
        self.record_stack_limit();
        self.propagate(result);
    }

    /// Runs `func` on the managed stack.
    ///
    /// If the task already runs on its managed stack, the function is called
    /// directly.
    pub(crate) unsafe fn call_on_managed_stack(
        mut self,
        args: *mut u8,
        func: UpcallWorker,
    ) {
        if self.location == Location::Managed {
            return func(args);
        }

        let foreign_sp = self.next_foreign_sp;
        let mut elsewhere: usize = 0;

        // When entered from a stack other than our own foreign stack (e.g.
        // the stack of the scheduler), upcalls must still use our own stack.
        let saved = if self.foreign.contains(stack_pointer()) {
            &mut self.next_foreign_sp as *mut usize
        } else {
            &mut elsewhere as *mut usize
        };

        let stack = sanitize_stack_pointer(self.next_managed_sp);

        self.location = Location::Managed;
        self.record_stack_limit();

        let result = self.switch(stack, args, func, saved);

        self.stack_limit = 0;
        self.location = Location::Foreign;
        self.next_foreign_sp = foreign_sp;
        self.propagate(result);
    }

    /// Fails the task, handing control over to its failure handler.
    pub(crate) fn fail(
        mut self,
        expression: String,
        file: String,
        line: usize,
    ) -> ! {
        let failure = TaskFailure { expression, file, line };

        error!(
            "task '{}' ({:#x}) failed at {}",
            self.name,
            self.identifier(),
            failure
        );

        self.unwinding = true;
        self.failure = Some(failure.clone());

        let Some(handler) = self.failure_handler.take() else {
            fatal(&format!(
                "task '{}' ({:#x}) failed while handling a failure",
                self.name,
                self.identifier()
            ));
        };

        let mut active = ActiveHandler { task: self, handler };

        active.handler.fail(self, failure)
    }

    /// Switches to the given stack, writing the stack pointer to return to
    /// into `saved`.
    unsafe fn switch(
        mut self,
        stack: usize,
        args: *mut u8,
        func: UpcallWorker,
        saved: *mut usize,
    ) -> Result<(), Unwind> {
        let _current = CurrentTask::enter(self);

        self.switches += 1;
        context::switch(stack, func, args, saved)
    }

    /// Continues an unwind caught on the other side of a stack switch.
    ///
    /// Task failures continue unwinding the task on the current stack. Any
    /// other unwind originates from foreign code, and can't be handled safely.
    fn propagate(self, result: Result<(), Unwind>) {
        let Err(payload) = result else { return };

        if payload.is::<TaskFailure>() {
            resume_unwind(payload);
        }

        fatal(&format!(
            "task '{}' ({:#x}) raised an exception across a stack boundary: {}",
            self.name,
            self.identifier(),
            unwind_message(&payload)
        ))
    }
}

impl Deref for TaskPointer {
    type Target = Task;

    fn deref(&self) -> &Task {
        unsafe { &*self.0.as_ptr() }
    }
}

impl DerefMut for TaskPointer {
    fn deref_mut(&mut self) -> &mut Task {
        unsafe { &mut *self.0.as_mut() }
    }
}
