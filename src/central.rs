use parking_lot::Mutex;

use crate::heap::PageHeap;
use crate::span::{Span, SpanId};

/// Free lists of one size class, shared by every thread.
///
/// Spans with at least one free slot sit on `partial`, the rest on `full`.
pub struct Central {
    class: usize,
    elem_size: usize,
    span_pages: usize,
    lists: Mutex<CentralLists>,
}

#[derive(Default)]
struct CentralLists {
    partial: Vec<SpanId>,
    full: Vec<SpanId>,
}

impl Central {
    pub fn new(class: usize, elem_size: usize, span_pages: usize) -> Self {
        Self {
            class,
            elem_size,
            span_pages,
            lists: Mutex::new(CentralLists::default()),
        }
    }

    pub fn class(&self) -> usize {
        self.class
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn span_pages(&self) -> usize {
        self.span_pages
    }

    /// Number of partial and full spans.
    pub fn span_counts(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.partial.len(), lists.full.len())
    }

    /// Allocates one object, carving a new span out of `heap` if no partial
    /// span is left.
    pub fn alloc(&self, heap: &PageHeap) -> usize {
        let mut lists = self.lists.lock();
        let top = lists.partial.last().copied();
        let id = match top {
            Some(id) => id,
            None => {
                let base = heap.alloc_pages(self.span_pages);
                let id = heap
                    .spans
                    .lock()
                    .insert(Span::small(base, self.span_pages, self.class, self.elem_size));
                log::trace!("class {} carved span {:?} at {:#x}", self.class, id, base);
                lists.partial.push(id);
                id
            }
        };

        let mut spans = heap.spans.lock();
        let span = match spans.get_mut(id) {
            Some(span) => span,
            None => fatal!("class {} lists dead span {:?}", self.class, id),
        };
        let addr = match span.alloc_slot() {
            Some(addr) => addr,
            None => fatal!("class {} has full span {:?} on its partial list", self.class, id),
        };
        if span.is_full() {
            lists.partial.pop();
            lists.full.push(id);
        }
        addr
    }

    /// Returns the object at `addr`. An emptied span goes back to the page
    /// heap unless it is the last partial span of the class.
    pub fn free(&self, heap: &PageHeap, addr: usize) {
        let mut lists = self.lists.lock();
        let mut spans = heap.spans.lock();
        let id = match spans.span_of(addr) {
            Some(id) => id,
            None => fatal!("free of {:#x} outside of any span", addr),
        };
        let span = match spans.get_mut(id) {
            Some(span) if span.class() == Some(self.class) => span,
            _ => fatal!("free of {:#x} to class {} from a foreign span", addr, self.class),
        };
        let was_full = span.is_full();
        span.free_slot(addr);
        let empty = span.is_empty();
        drop(spans);

        if was_full {
            remove_id(&mut lists.full, id);
            lists.partial.push(id);
        }
        if empty && lists.partial.len() > 1 {
            remove_id(&mut lists.partial, id);
            drop(lists);
            heap.free_span(id);
        }
    }
}

fn remove_id(list: &mut Vec<SpanId>, id: SpanId) {
    match list.iter().position(|&x| x == id) {
        Some(i) => {
            list.swap_remove(i);
        }
        None => fatal!("span {:?} missing from its list", id),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::globals::PAGE_SIZE;
    use crate::mmap::NoopMemory;
    use crate::{Config, PageHeap, SizeClass};

    fn heap() -> Arc<PageHeap> {
        let config = Config {
            size_classes: vec![SizeClass {
                size: PAGE_SIZE / 2,
                pages: 1,
            }],
            ..Config::default()
        };
        PageHeap::new(config, Arc::new(NoopMemory::new())).unwrap()
    }

    #[test]
    fn test_partial_and_full_lists() {
        let heap = heap();
        let central = &heap.centrals()[0];
        let a = central.alloc(&heap);
        let b = central.alloc(&heap);
        assert_eq!(b, a + PAGE_SIZE / 2);
        assert_eq!(central.span_counts(), (0, 1));

        let c = central.alloc(&heap);
        assert_ne!(heap.span_of(c), heap.span_of(a));
        assert_eq!(central.span_counts(), (1, 1));

        central.free(&heap, a);
        assert_eq!(central.span_counts(), (2, 0));
        // Emptied while another partial span exists: back to the heap.
        central.free(&heap, b);
        assert_eq!(central.span_counts(), (1, 0));
        assert_eq!(heap.span_of(a), None);
        assert_eq!(heap.statistics().spans, 1);
        assert_eq!(heap.statistics().heap_inuse, PAGE_SIZE);

        // The last partial span stays even when empty.
        central.free(&heap, c);
        assert_eq!(central.span_counts(), (1, 0));
        assert_eq!(central.alloc(&heap), c);
    }

    #[test]
    #[should_panic]
    fn test_free_outside_spans() {
        let heap = heap();
        let central = &heap.centrals()[0];
        let a = central.alloc(&heap);
        central.free(&heap, a + 4 * PAGE_SIZE);
    }
}
