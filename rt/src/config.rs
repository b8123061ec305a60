use crate::stack::LIMIT_RESERVE;
use std::env::var;

/// Sets a configuration field based on an environment variable.
macro_rules! set_from_env {
    ($config:expr, $field:ident, $key:expr, $value_type:ty) => {{
        if let Ok(raw_value) = var(concat!("UPCALL_", $key)) {
            if let Ok(value) = raw_value.parse::<$value_type>() {
                if value > 0 {
                    $config.$field = value;
                }
            }
        };
    }};
}

/// Enables a configuration flag if the environment variable is set, regardless
/// of its value.
macro_rules! enable_from_env {
    ($config:expr, $field:ident, $key:expr) => {{
        if var(concat!("UPCALL_", $key)).is_ok() {
            $config.$field = true;
        }
    }};
}

/// The default size of a task's foreign stack in bytes.
///
/// Foreign code (and the runtime itself) doesn't check for stack overflows the
/// way generated code does, so this stack must be large enough for whatever
/// foreign functions a program calls.
const DEFAULT_FOREIGN_STACK_SIZE: usize = 1024 * 1024;

/// The default minimum size of a managed stack segment.
const DEFAULT_MIN_STACK_SIZE: usize = 64 * 1024;

/// The default amount of managed stack memory a single task may use.
const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024 * 1024;

/// Structure containing the configuration settings for the upcall runtime.
pub struct Config {
    /// The size of each task's foreign stack in bytes.
    pub foreign_stack_size: usize,

    /// The minimum size of a managed stack segment, excluding the red zone and
    /// guard page.
    pub min_stack_size: usize,

    /// The maximum amount of managed stack (summed over all segments) a task
    /// may use.
    ///
    /// While unwinding a task may use up to twice this amount, so destructors
    /// have room to run.
    pub max_stack_size: usize,

    /// Record a backtrace for every task-local allocation.
    pub track_origins: bool,

    /// Terminate the program when a task fails, instead of unwinding the task.
    pub abort_on_failure: bool,
}

impl Config {
    pub(crate) fn new() -> Config {
        Config {
            foreign_stack_size: DEFAULT_FOREIGN_STACK_SIZE,
            min_stack_size: DEFAULT_MIN_STACK_SIZE,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            track_origins: false,
            abort_on_failure: false,
        }
    }

    pub fn from_env() -> Config {
        let mut config = Config::new();

        set_from_env!(config, foreign_stack_size, "FOREIGN_STACK_SIZE", usize);
        set_from_env!(config, min_stack_size, "MIN_STACK_SIZE", usize);
        set_from_env!(config, max_stack_size, "MAX_STACK_SIZE", usize);
        enable_from_env!(config, track_origins, "TRACK_ORIGINS");
        enable_from_env!(config, abort_on_failure, "ABORT_ON_FAILURE");

        config.verify();
        config
    }

    fn verify(&mut self) {
        // Segments smaller than this can't hold a single frame once the stack
        // limit is recorded.
        if self.min_stack_size <= LIMIT_RESERVE {
            self.min_stack_size = LIMIT_RESERVE * 2;
        }

        if self.max_stack_size < self.min_stack_size {
            self.max_stack_size = self.min_stack_size;
        }
    }
}
