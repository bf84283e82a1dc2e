//! Error handling for the Robusta Garbage Collector.

/// Robusta Garbage Collector result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur during garbage collection and memory management.
///
/// User code invoked by the collector (finalizers, weakref callbacks, clear hooks, collection
/// callbacks) never surfaces here; panics from those are routed to the runtime's unraisable hook.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A public API argument was outside its accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// An auxiliary allocation inside the collector failed; the collection was abandoned
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let error = Error::InvalidArgument("generation 7".to_string());
        assert_eq!(error.to_string(), "Invalid argument: generation 7");
    }

    #[test]
    fn test_out_of_memory_display() {
        let error = Error::OutOfMemory("work queue".to_string());
        assert_eq!(error.to_string(), "Out of memory: work queue");
    }
}
