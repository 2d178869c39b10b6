//! Resource tracking and cooperative cancellation for the resolver.
//!
//! The machine is parameterized over a [`ResourceTracker`] so the production
//! default, [`NoLimitTracker`], monomorphizes every check away. The checks
//! run at the three points resolution can run away: heap allocation,
//! choicepoint creation and backtracking. The latter two double as the
//! cooperative cancellation points: a [`LimitedTracker`] carrying a stop flag
//! makes the resolver terminate at the next check with "no more solutions",
//! leaving no externally visible partial state.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Error returned when a resource limit is exceeded during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum instruction steps exceeded.
    Steps { limit: u64 },
    /// Maximum heap size exceeded.
    HeapCells { limit: usize },
    /// Maximum live choicepoints exceeded.
    Choicepoints { limit: usize },
    /// The stop flag was raised; the resolver reports exhaustion rather than
    /// an error for this case.
    Interrupted,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps { limit } => write!(f, "instruction step limit exceeded: {limit}"),
            Self::HeapCells { limit } => write!(f, "heap limit exceeded: {limit} cells"),
            Self::Choicepoints { limit } => write!(f, "choicepoint limit exceeded: {limit}"),
            Self::Interrupted => write!(f, "resolution interrupted"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Trait for bounding a resolution.
///
/// All methods return `Ok(())` when execution may continue. Implementations
/// should be cheap: `on_step` runs once per dispatched instruction.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each instruction dispatch.
    fn on_step(&mut self) -> Result<(), ResourceError>;

    /// Called when the heap grows, with the new cell count.
    fn on_heap_grow(&mut self, cells: usize) -> Result<(), ResourceError>;

    /// Called before a choicepoint is pushed, with the new depth. Doubles as
    /// a cancellation point.
    fn on_choicepoint(&mut self, depth: usize) -> Result<(), ResourceError>;

    /// Called on every backtrack. Doubles as a cancellation point.
    fn on_backtrack(&mut self) -> Result<(), ResourceError>;
}

/// A tracker that enforces nothing.
///
/// Because the machine carries the tracker as a type parameter, the compiler
/// monomorphizes every check in this impl to nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline(always)]
    fn on_step(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline(always)]
    fn on_heap_grow(&mut self, _cells: usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline(always)]
    fn on_choicepoint(&mut self, _depth: usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline(always)]
    fn on_backtrack(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// A tracker enforcing step, heap and choicepoint ceilings plus an optional
/// cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct LimitedTracker {
    max_steps: Option<u64>,
    max_heap_cells: Option<usize>,
    max_choicepoints: Option<usize>,
    stop: Option<Arc<AtomicBool>>,
    steps: u64,
}

impl LimitedTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of dispatched instructions.
    #[must_use]
    pub fn with_max_steps(mut self, limit: u64) -> Self {
        self.max_steps = Some(limit);
        self
    }

    /// Caps the heap size in cells.
    #[must_use]
    pub fn with_max_heap_cells(mut self, limit: usize) -> Self {
        self.max_heap_cells = Some(limit);
        self
    }

    /// Caps the number of simultaneously live choicepoints.
    #[must_use]
    pub fn with_max_choicepoints(mut self, limit: usize) -> Self {
        self.max_choicepoints = Some(limit);
        self
    }

    /// Attaches a stop flag checked at choicepoint creation and backtracking.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn check_stop(&self) -> Result<(), ResourceError> {
        match &self.stop {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(ResourceError::Interrupted),
            _ => Ok(()),
        }
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_step(&mut self) -> Result<(), ResourceError> {
        self.steps += 1;
        match self.max_steps {
            Some(limit) if self.steps > limit => Err(ResourceError::Steps { limit }),
            _ => Ok(()),
        }
    }

    fn on_heap_grow(&mut self, cells: usize) -> Result<(), ResourceError> {
        match self.max_heap_cells {
            Some(limit) if cells > limit => Err(ResourceError::HeapCells { limit }),
            _ => Ok(()),
        }
    }

    fn on_choicepoint(&mut self, depth: usize) -> Result<(), ResourceError> {
        self.check_stop()?;
        match self.max_choicepoints {
            Some(limit) if depth > limit => Err(ResourceError::Choicepoints { limit }),
            _ => Ok(()),
        }
    }

    fn on_backtrack(&mut self) -> Result<(), ResourceError> {
        self.check_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_limit_trips_after_limit() {
        let mut tracker = LimitedTracker::new().with_max_steps(2);
        assert!(tracker.on_step().is_ok());
        assert!(tracker.on_step().is_ok());
        assert_eq!(tracker.on_step(), Err(ResourceError::Steps { limit: 2 }));
    }

    #[test]
    fn stop_flag_interrupts_at_checkpoints() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut tracker = LimitedTracker::new().with_stop_flag(Arc::clone(&stop));
        assert!(tracker.on_choicepoint(1).is_ok());
        stop.store(true, Ordering::Relaxed);
        assert_eq!(tracker.on_backtrack(), Err(ResourceError::Interrupted));
        assert_eq!(tracker.on_choicepoint(2), Err(ResourceError::Interrupted));
    }
}
