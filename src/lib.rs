use std::time::Duration;

use thiserror::Error;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

/// Reports a broken heap invariant and aborts the current thread. Anything
/// worth dumping should be logged before invoking this.
macro_rules! fatal {
    ($($t:tt)*) => {{
        log::error!($($t)*);
        panic!($($t)*)
    }};
}

pub mod central;
pub mod diag;
pub mod globals;
pub mod heap;
pub mod internal;
pub mod local_heap;
pub mod mmap;
pub mod page_alloc;
pub mod page_cache;
pub mod scavenger;
pub mod span;
pub mod statistics;
pub mod util;

pub use heap::PageHeap;
pub use local_heap::LocalHeap;
pub use page_alloc::PageAlloc;
pub use page_cache::PageCache;
pub use scavenger::{BackgroundScavenger, GcPacing, ScavengerState};

/// One size class served by a `Central`: objects of `size` bytes carved out
/// of spans of `pages` pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeClass {
    pub size: usize,
    pub pages: usize,
}

/// Power-of-two classes from 16 bytes to 32K, each span holding at least
/// four objects.
pub fn default_size_classes() -> Vec<SizeClass> {
    (4..=15)
        .map(|shift| {
            let size = 1usize << shift;
            SizeClass {
                size,
                pages: (size * 4 / globals::PAGE_SIZE).max(1),
            }
        })
        .collect()
}

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of each address-space reservation made when the heap runs out of
    /// pages. Rounded up to whole chunks.
    pub arena_size: usize,
    /// Extra memory, in percent of the retained goal, kept around to absorb
    /// heap growth before it is scavenged.
    pub retain_extra_percent: f64,
    /// Share of one core the background scavenger may use, in percent.
    pub scavenge_percent: f64,
    /// Worst-case time to release one physical page.
    pub scavenge_page_latency: Duration,
    /// Worst-case time to release one huge page.
    pub scavenge_huge_page_latency: Duration,
    /// Shortest sleep the background scavenger takes. Shorter pauses yield.
    pub scavenger_min_sleep: Duration,
    pub size_classes: Vec<SizeClass>,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_size: 64 * 1024 * 1024,
            retain_extra_percent: 10.0,
            scavenge_percent: 1.0,
            scavenge_page_latency: Duration::from_micros(10),
            scavenge_huge_page_latency: Duration::from_micros(10),
            scavenger_min_sleep: Duration::from_micros(100),
            size_classes: default_size_classes(),
            verbose: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("arena size {0:#x} is not a non-zero multiple of the chunk size")]
    ArenaSize(usize),
    #[error("{name} must be a finite non-negative number, got {value}")]
    Percent { name: &'static str, value: f64 },
    #[error("scavenge_percent must be above zero")]
    NoScavengeTime,
    #[error("size class {index} ({size} bytes in {pages} pages) holds no object")]
    SizeClass {
        index: usize,
        size: usize,
        pages: usize,
    },
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_size == 0 || self.arena_size % globals::CHUNK_BYTES != 0 {
            return Err(ConfigError::ArenaSize(self.arena_size));
        }
        for (name, value) in [
            ("retain_extra_percent", self.retain_extra_percent),
            ("scavenge_percent", self.scavenge_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Percent { name, value });
            }
        }
        if self.scavenge_percent == 0.0 {
            return Err(ConfigError::NoScavengeTime);
        }
        for (index, class) in self.size_classes.iter().enumerate() {
            if class.size == 0 || class.pages == 0 || class.size > class.pages * globals::PAGE_SIZE {
                return Err(ConfigError::SizeClass {
                    index,
                    size: class.size,
                    pages: class.pages,
                });
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.size_classes.first(), Some(&SizeClass { size: 16, pages: 1 }));
        assert_eq!(config.size_classes.last(), Some(&SizeClass { size: 32768, pages: 16 }));
    }

    #[test]
    fn test_validate_rejects() {
        let config = Config {
            arena_size: globals::CHUNK_BYTES + 1,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ArenaSize(globals::CHUNK_BYTES + 1)));

        let config = Config {
            scavenge_percent: 0.0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoScavengeTime));

        let config = Config {
            retain_extra_percent: f64::NAN,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Percent { .. })));

        let config = Config {
            size_classes: vec![SizeClass { size: 3 * globals::PAGE_SIZE, pages: 2 }],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::SizeClass { index: 0, .. })));
    }
}
