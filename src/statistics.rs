/// A snapshot of the heap's memory accounting.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStatistics {
    pub heap_sys: usize,
    pub heap_released: usize,
    pub heap_inuse: usize,
    pub heap_idle: usize,
    /// `heap_sys - heap_released`, roughly what the heap adds to the RSS.
    pub retained: usize,
    pub metadata_sys: usize,
    pub chunks: usize,
    pub spans: usize,
    /// Retained size the scavenger works toward, once it has been paced.
    pub scavenge_goal: Option<usize>,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Mapped: {} in {} chunks",
            formatted_size(self.heap_sys),
            self.chunks
        )?;
        writeln!(
            f,
            "  In use: {} ({} idle)",
            formatted_size(self.heap_inuse),
            formatted_size(self.heap_idle)
        )?;
        writeln!(
            f,
            "  Released to the OS: {} ({:.2}%)",
            formatted_size(self.heap_released),
            if self.heap_sys == 0 {
                0.0
            } else {
                self.heap_released as f64 / self.heap_sys as f64 * 100.0
            }
        )?;
        writeln!(f, "  Retained: {}", formatted_size(self.retained))?;
        match self.scavenge_goal {
            Some(goal) => writeln!(f, "  Scavenge goal: {}", formatted_size(goal))?,
            None => writeln!(f, "  Scavenge goal: none")?,
        }
        writeln!(f, "  Metadata: {}", formatted_size(self.metadata_sys))?;
        writeln!(f, "  Spans: {}", self.spans)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(1536).to_string(), "1.5K");
        assert_eq!(formatted_size(64 << 20).to_string(), "64.0M");
        assert_eq!(formatted_size(3 << 30).to_string(), "3.0G");
    }

    #[test]
    fn test_display() {
        let stats = HeapStatistics {
            heap_sys: 16 << 20,
            heap_released: 4 << 20,
            heap_inuse: 8 << 20,
            heap_idle: 8 << 20,
            retained: 12 << 20,
            metadata_sys: 4096,
            chunks: 4,
            spans: 7,
            scavenge_goal: None,
        };
        let text = stats.to_string();
        assert!(text.contains("Mapped: 16.0M in 4 chunks"));
        assert!(text.contains("Released to the OS: 4.0M (25.00%)"));
        assert!(text.contains("Scavenge goal: none"));
        assert!(text.contains("Metadata: 4.0K"));
    }
}
