//! Configuration and statistics for garbage collection.

use bitflags::bitflags;

/// Initial collection threshold in tracked objects.
pub const DEFAULT_THRESHOLD: isize = 7000;

/// Default growth percentage applied to the live-object count when recomputing the threshold
/// after a collection.
pub const DEFAULT_SCALE: i32 = 25;

/// Environment variable overriding the threshold growth percentage.
pub const SCALE_ENV_VAR: &str = "ROBUSTA_GC_SCALE";

bitflags! {
    /// Debugging flags controlling collector diagnostics.
    ///
    /// - `STATS`: log collection statistics.
    /// - `COLLECTABLE`: log collectable objects found.
    /// - `UNCOLLECTABLE`: log unreachable but uncollectable objects found.
    /// - `SAVE_ALL`: save all unreachable objects to the garbage list rather than reclaiming them.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DebugFlags: u32 {
        const STATS = 1;
        const COLLECTABLE = 2;
        const UNCOLLECTABLE = 4;
        const SAVE_ALL = 32;
        const LEAK = Self::COLLECTABLE.bits() | Self::UNCOLLECTABLE.bits() | Self::SAVE_ALL.bits();
    }
}

/// Configuration for the garbage collector runtime.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Whether automatic (allocation-triggered) collection starts enabled
    pub enabled: bool,
    /// Collection threshold in tracked objects
    pub threshold: isize,
    /// Threshold growth percentage; the post-collection threshold is
    /// `max(7000, live * (100 + scale) / 100)`
    pub scale: i32,
    /// Whether heap blocks carry the two-word debug prefix
    pub debug_allocator: bool,
}

impl Default for Configuration {
    /// Creates a default configuration:
    /// - automatic collection enabled
    /// - `threshold` of 7000 tracked objects
    /// - `scale` of 25 percent, overridable via the `ROBUSTA_GC_SCALE` environment variable
    /// - debug allocator disabled
    fn default() -> Self {
        let mut scale = DEFAULT_SCALE;
        if let Ok(value) = std::env::var(SCALE_ENV_VAR) {
            if let Ok(parsed) = value.trim().parse::<i32>() {
                scale = parsed;
            }
        }
        Self {
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
            scale,
            debug_allocator: false,
        }
    }
}

/// Per-generation collection statistics. The collector is single-generation; the vector returned
/// by `Runtime::get_stats` holds one entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GenerationStats {
    /// Number of completed collections
    pub collections: usize,
    /// Total objects reclaimed by cycle collection
    pub collected: usize,
    /// Total unreachable objects that could not be reclaimed
    pub uncollectable: usize,
}

/// Information passed to registered collection callbacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionInfo {
    /// Generation collected; always zero
    pub generation: usize,
    /// Objects reclaimed by this collection
    pub collected: usize,
    /// Unreachable objects that could not be reclaimed
    pub uncollectable: usize,
}
