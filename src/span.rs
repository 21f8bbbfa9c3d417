use std::collections::BTreeMap;

use crate::globals::PAGE_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanState {
    /// Handed back to the page allocator.
    Free,
    /// Holds heap objects, either one large object or slots of a size class.
    InUse,
    /// Memory managed by the runtime itself, such as stacks.
    Manual,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpanId(u32);

impl SpanId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous run of pages allocated as one unit.
#[derive(Debug)]
pub struct Span {
    base: usize,
    npages: usize,
    state: SpanState,
    /// Size class index, `None` for large and manual spans.
    class: Option<usize>,
    elem_size: usize,
    nelems: usize,
    alloc_count: usize,
    /// Slots freed since the span was carved, reused first.
    free_slots: Vec<u32>,
    /// Slots at or above this were never handed out.
    fresh: usize,
}

impl Span {
    /// A span of `npages` pages cut into slots of `elem_size` bytes.
    pub fn small(base: usize, npages: usize, class: usize, elem_size: usize) -> Self {
        Self {
            base,
            npages,
            state: SpanState::InUse,
            class: Some(class),
            elem_size,
            nelems: npages * PAGE_SIZE / elem_size,
            alloc_count: 0,
            free_slots: Vec::new(),
            fresh: 0,
        }
    }

    /// A span holding one object that covers all of it.
    pub fn large(base: usize, npages: usize) -> Self {
        Self::whole(base, npages, SpanState::InUse)
    }

    pub fn manual(base: usize, npages: usize) -> Self {
        Self::whole(base, npages, SpanState::Manual)
    }

    fn whole(base: usize, npages: usize, state: SpanState) -> Self {
        Self {
            base,
            npages,
            state,
            class: None,
            elem_size: npages * PAGE_SIZE,
            nelems: 1,
            alloc_count: 1,
            free_slots: Vec::new(),
            fresh: 1,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn limit(&self) -> usize {
        self.base + self.npages * PAGE_SIZE
    }

    pub fn state(&self) -> SpanState {
        self.state
    }

    pub fn class(&self) -> Option<usize> {
        self.class
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn nelems(&self) -> usize {
        self.nelems
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit()
    }

    pub fn is_full(&self) -> bool {
        self.alloc_count == self.nelems
    }

    pub fn is_empty(&self) -> bool {
        self.alloc_count == 0
    }

    /// Hands out a free slot. Recently freed slots go first.
    pub fn alloc_slot(&mut self) -> Option<usize> {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot as usize,
            None if self.fresh < self.nelems => {
                self.fresh += 1;
                self.fresh - 1
            }
            None => return None,
        };
        self.alloc_count += 1;
        Some(self.base + slot * self.elem_size)
    }

    pub fn free_slot(&mut self, addr: usize) {
        if !self.contains(addr) || (addr - self.base) % self.elem_size != 0 {
            fatal!("{:#x} is not a slot of span {:#x}+{} pages", addr, self.base, self.npages);
        }
        let slot = (addr - self.base) / self.elem_size;
        if slot >= self.fresh || self.alloc_count == 0 {
            fatal!("free of unallocated slot {:#x} in span {:#x}", addr, self.base);
        }
        self.alloc_count -= 1;
        self.free_slots.push(slot as u32);
    }
}

/// Arena of live spans with an address index.
#[derive(Default)]
pub struct SpanSet {
    spans: Vec<Option<Span>>,
    /// Slots of removed spans, reused by `insert`.
    dead: Vec<u32>,
    by_base: BTreeMap<usize, SpanId>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    pub fn insert(&mut self, span: Span) -> SpanId {
        if let Some(prev) = self.span_of(span.base) {
            fatal!("span at {:#x} overlaps span {:?}", span.base, prev);
        }
        let base = span.base;
        let id = match self.dead.pop() {
            Some(i) => {
                self.spans[i as usize] = Some(span);
                SpanId(i)
            }
            None => {
                self.spans.push(Some(span));
                SpanId(self.spans.len() as u32 - 1)
            }
        };
        self.by_base.insert(base, id);
        id
    }

    /// Takes the span out of the set and marks it free.
    pub fn remove(&mut self, id: SpanId) -> Span {
        let mut span = match self.spans.get_mut(id.index()).and_then(Option::take) {
            Some(span) => span,
            None => fatal!("remove of dead span {:?}", id),
        };
        self.by_base.remove(&span.base);
        self.dead.push(id.0);
        span.state = SpanState::Free;
        span
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.spans.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SpanId) -> Option<&mut Span> {
        self.spans.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// The span whose pages contain `addr`.
    pub fn span_of(&self, addr: usize) -> Option<SpanId> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        match self.get(id) {
            Some(span) if span.contains(addr) => Some(id),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpanId, &Span)> + '_ {
        self.by_base.values().filter_map(move |&id| Some((id, self.get(id)?)))
    }
}
