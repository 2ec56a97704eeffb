//! Execution observer protocol.
//!
//! Observers receive synchronous callbacks from the dispatch loop and can
//! halt execution by returning `false`. They drive profilers, debuggers,
//! and coverage tools without touching the interpreter core.

/// When `on_step` fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveMode {
    /// Every instruction.
    All,
    /// Never.
    None,
    /// Every Nth instruction; zero normalizes to 1 at attach time.
    Sampled(u32),
    /// Whenever the (code object, source line) pair changes. Synthetic
    /// instructions with line zero are suppressed.
    OnLine,
}

/// Observer configuration, normalized once when the observer is attached.
#[derive(Debug, Clone, Copy)]
pub struct ObserverConfig {
    pub mode: ObserveMode,
    pub observe_calls: bool,
    pub observe_returns: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            mode: ObserveMode::All,
            observe_calls: true,
            observe_returns: true,
        }
    }
}

impl ObserverConfig {
    pub fn normalized(self) -> Self {
        let mode = match self.mode {
            ObserveMode::Sampled(0) => ObserveMode::Sampled(1),
            other => other,
        };
        Self { mode, ..self }
    }
}

/// Data for an `on_step` callback, describing the instruction about to
/// execute.
#[derive(Debug, Clone)]
pub struct StepEvent<'a> {
    pub ip: usize,
    /// 1-based source line; zero for synthetic instructions.
    pub line: usize,
    pub depth: usize,
    pub function: &'a str,
    pub file: &'a str,
}

/// Data for an `on_call` callback; `depth` is the callee's depth.
#[derive(Debug, Clone)]
pub struct CallEvent<'a> {
    pub function: &'a str,
    pub depth: usize,
}

/// Data for an `on_return` callback, fired before the caller's frame is
/// restored.
#[derive(Debug, Clone)]
pub struct ReturnEvent<'a> {
    pub function: &'a str,
    pub depth: usize,
}

/// Synchronous execution observer. Each callback returns `true` to
/// continue; `false` halts the VM with a "halted by observer" error.
pub trait Observer {
    fn config(&self) -> ObserverConfig {
        ObserverConfig::default()
    }

    fn on_step(&mut self, event: &StepEvent) -> bool {
        let _ = event;
        true
    }

    fn on_call(&mut self, event: &CallEvent) -> bool {
        let _ = event;
        true
    }

    fn on_return(&mut self, event: &ReturnEvent) -> bool {
        let _ = event;
        true
    }
}
