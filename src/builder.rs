//! Chained process configuration: pick a name, a priority, and a stack
//! size, then spawn and start a process in one call.

use crate::kernel::Kernel;
use crate::process::Process;
use crate::signal::Signal;

/// Process spawn options: name, priority, stack size.
#[derive(Debug, Clone)]
pub struct Options {
    pub stack_size: usize,
    pub name: Option<String>,
    pub priority: i64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: crate::DEFAULT_STACK_SIZE,
            name: None,
            priority: 0,
        }
    }
}

/// Chained process configuration. Generate the base configuration with
/// [`Builder::new`], refine it, then [`Builder::spawn`] to build the
/// process and schedule its start event in one call.
///
/// ```ignore
/// let p = Builder::new()
///     .name("arrival")
///     .priority(0)
///     .spawn(&kernel, |me| {
///         // ... me.hold(1.0) ...
///         Signal::SUCCESS
///     });
/// ```
pub struct Builder {
    opts: Options,
}

impl Builder {
    /// Generate the base configuration for spawning a process, from which
    /// configuration methods can be chained.
    pub fn new() -> Builder {
        Builder {
            opts: Options::default(),
        }
    }

    /// Name the process-to-be. Used for identification in logs and panic
    /// messages.
    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.opts.name = Some(name.into());
        self
    }

    /// Set the process's initial priority.
    pub fn priority(mut self, priority: i64) -> Builder {
        self.opts.priority = priority;
        self
    }

    /// Set the size of the stack backing the new process's coroutine.
    /// Defaults to [`crate::DEFAULT_STACK_SIZE`].
    pub fn stack_size(mut self, size: usize) -> Builder {
        self.opts.stack_size = size;
        self
    }

    /// Build the process under `kernel` with `entry` as its body, and
    /// schedule its zero-duration start event. Returns the new,
    /// not-yet-running `Process` immediately; `entry` begins executing once
    /// `kernel` dispatches the start event.
    pub fn spawn<F>(self, kernel: &Kernel, entry: F) -> Process
    where
        F: FnOnce(Process) -> Signal + Send + 'static,
    {
        let name = self
            .opts
            .name
            .unwrap_or_else(|| "<unnamed process>".to_string());
        let process = Process::spawn_with_stack_size(kernel, name, self.opts.priority, self.opts.stack_size, entry);
        process.start();
        process
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use std::sync::{Arc, Mutex};

    #[test]
    fn builder_spawns_and_starts_with_configured_priority_and_name() {
        let kernel = Kernel::new(0.0);
        let seen_name = Arc::new(Mutex::new(None));
        let seen_name_inner = seen_name.clone();

        let p = Builder::new()
            .name("widget-press")
            .priority(7)
            .spawn(&kernel, move |me| {
                *seen_name_inner.lock().unwrap() = Some(me.name());
                Signal::SUCCESS
            });
        assert_eq!(p.priority(), 7);
        assert_eq!(p.name(), "widget-press");

        kernel.run();
        assert_eq!(*seen_name.lock().unwrap(), Some("widget-press".to_string()));
    }
}
