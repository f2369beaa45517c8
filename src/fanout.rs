//! Lazy fan-out of a pair-producing source into two independent cursors
//!
//! Perturbation yields `(batch, mask)` pairs that two downstream stages
//! consume at different times: scoring reads batches, aggregation reads
//! masks. [`split_pairs`] hands each side its own cursor over one shared,
//! append-only buffer so the producer runs exactly once per index no matter
//! which side asks first or how reads interleave.
//!
//! ## Contract
//!
//! A cursor requesting index `i` advances the producer only up to `i`, never
//! speculatively past it. Produced pairs stay in the buffer, so either side
//! can rewind or random-access anything already produced. A producer error is
//! returned to the consumer that triggered it and poisons later reads past
//! the produced prefix. Single-threaded use only.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::errors::ExplanationError;

struct SharedBuffer<A, B, I> {
    source: I,
    items: Vec<(A, B)>,
    exhausted: bool,
    failure: Option<String>,
}

impl<A, B, I> SharedBuffer<A, B, I>
where
    I: Iterator<Item = Result<(A, B)>>,
{
    /// Advance the source until `items[index]` exists.
    ///
    /// Returns `Ok(false)` when the source ends first.
    fn fill_to(&mut self, index: usize) -> Result<bool> {
        while self.items.len() <= index {
            if let Some(message) = &self.failure {
                bail!("pair source failed earlier: {message}");
            }
            if self.exhausted {
                return Ok(false);
            }
            match self.source.next() {
                Some(Ok(pair)) => self.items.push(pair),
                Some(Err(e)) => {
                    self.failure = Some(e.to_string());
                    return Err(e);
                }
                None => self.exhausted = true,
            }
        }
        Ok(true)
    }

    fn produced(&self) -> usize {
        self.items.len()
    }
}

/// Split a source of `(A, B)` pairs into an `A` cursor and a `B` cursor
/// backed by one shared buffer.
pub fn split_pairs<A, B, I>(source: I) -> (LeftCursor<A, B, I>, RightCursor<A, B, I>)
where
    A: Clone,
    B: Clone,
    I: Iterator<Item = Result<(A, B)>>,
{
    let buffer = Rc::new(RefCell::new(SharedBuffer {
        source,
        items: Vec::new(),
        exhausted: false,
        failure: None,
    }));
    (
        LeftCursor {
            buffer: Rc::clone(&buffer),
            position: 0,
            start: 0,
            end: None,
            stopped: false,
        },
        RightCursor {
            buffer,
            position: 0,
            start: 0,
            end: None,
            stopped: false,
        },
    )
}

/// Cursor over the first element of every produced pair.
pub struct LeftCursor<A, B, I> {
    buffer: Rc<RefCell<SharedBuffer<A, B, I>>>,
    position: usize,
    start: usize,
    end: Option<usize>,
    stopped: bool,
}

impl<A, B, I> LeftCursor<A, B, I>
where
    A: Clone,
    B: Clone,
    I: Iterator<Item = Result<(A, B)>>,
{
    /// Random access relative to this cursor's view, producing missing pairs
    /// on demand.
    pub fn get(&mut self, index: usize) -> Result<A> {
        let absolute = self.start + index;
        if let Some(end) = self.end {
            if absolute >= end {
                return Err(ExplanationError::ExhaustedSource {
                    requested: index,
                    available: end - self.start,
                }
                .into());
            }
        }
        let filled = self.buffer.borrow_mut().fill_to(absolute)?;
        if !filled {
            return Err(ExplanationError::ExhaustedSource {
                requested: index,
                available: self.available(),
            }
            .into());
        }
        Ok(self.buffer.borrow().items[absolute].0.clone())
    }

    /// Pairs currently reachable through this view without further
    /// production.
    pub fn available(&self) -> usize {
        let produced = self.buffer.borrow().produced();
        let cap = match self.end {
            Some(end) => end.min(produced),
            None => produced,
        };
        cap.saturating_sub(self.start)
    }

    /// Total pairs produced into the shared buffer so far.
    pub fn produced(&self) -> usize {
        self.buffer.borrow().produced()
    }

    /// Contiguous sub-view over `[start, end)` of this cursor's index space,
    /// sharing the same buffer.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let absolute_start = self.start + start;
        let absolute_end = self.start + end.max(start);
        let capped = match self.end {
            Some(existing) => absolute_end.min(existing),
            None => absolute_end,
        };
        Self {
            buffer: Rc::clone(&self.buffer),
            position: absolute_start,
            start: absolute_start,
            end: Some(capped),
            stopped: false,
        }
    }

    /// Reset iteration to the start of this view. Buffered pairs are replayed
    /// without touching the source.
    pub fn rewind(&mut self) {
        self.position = self.start;
        self.stopped = false;
    }
}

impl<A, B, I> Iterator for LeftCursor<A, B, I>
where
    A: Clone,
    B: Clone,
    I: Iterator<Item = Result<(A, B)>>,
{
    type Item = Result<A>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if let Some(end) = self.end {
            if self.position >= end {
                return None;
            }
        }
        let absolute = self.position;
        let filled = self.buffer.borrow_mut().fill_to(absolute);
        match filled {
            Ok(true) => {
                self.position += 1;
                Some(Ok(self.buffer.borrow().items[absolute].0.clone()))
            }
            Ok(false) => None,
            Err(e) => {
                // Yield the failure once, then end the iteration.
                self.stopped = true;
                Some(Err(e))
            }
        }
    }
}

/// Cursor over the second element of every produced pair.
pub struct RightCursor<A, B, I> {
    buffer: Rc<RefCell<SharedBuffer<A, B, I>>>,
    position: usize,
    start: usize,
    end: Option<usize>,
    stopped: bool,
}

impl<A, B, I> RightCursor<A, B, I>
where
    A: Clone,
    B: Clone,
    I: Iterator<Item = Result<(A, B)>>,
{
    /// Random access relative to this cursor's view, producing missing pairs
    /// on demand.
    pub fn get(&mut self, index: usize) -> Result<B> {
        let absolute = self.start + index;
        if let Some(end) = self.end {
            if absolute >= end {
                return Err(ExplanationError::ExhaustedSource {
                    requested: index,
                    available: end - self.start,
                }
                .into());
            }
        }
        let filled = self.buffer.borrow_mut().fill_to(absolute)?;
        if !filled {
            return Err(ExplanationError::ExhaustedSource {
                requested: index,
                available: self.available(),
            }
            .into());
        }
        Ok(self.buffer.borrow().items[absolute].1.clone())
    }

    /// Pairs currently reachable through this view without further
    /// production.
    pub fn available(&self) -> usize {
        let produced = self.buffer.borrow().produced();
        let cap = match self.end {
            Some(end) => end.min(produced),
            None => produced,
        };
        cap.saturating_sub(self.start)
    }

    /// Total pairs produced into the shared buffer so far.
    pub fn produced(&self) -> usize {
        self.buffer.borrow().produced()
    }

    /// Contiguous sub-view over `[start, end)` of this cursor's index space,
    /// sharing the same buffer.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let absolute_start = self.start + start;
        let absolute_end = self.start + end.max(start);
        let capped = match self.end {
            Some(existing) => absolute_end.min(existing),
            None => absolute_end,
        };
        Self {
            buffer: Rc::clone(&self.buffer),
            position: absolute_start,
            start: absolute_start,
            end: Some(capped),
            stopped: false,
        }
    }

    /// Reset iteration to the start of this view. Buffered pairs are replayed
    /// without touching the source.
    pub fn rewind(&mut self) {
        self.position = self.start;
        self.stopped = false;
    }
}

impl<A, B, I> Iterator for RightCursor<A, B, I>
where
    A: Clone,
    B: Clone,
    I: Iterator<Item = Result<(A, B)>>,
{
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if let Some(end) = self.end {
            if self.position >= end {
                return None;
            }
        }
        let absolute = self.position;
        let filled = self.buffer.borrow_mut().fill_to(absolute);
        match filled {
            Ok(true) => {
                self.position += 1;
                Some(Ok(self.buffer.borrow().items[absolute].1.clone()))
            }
            Ok(false) => None,
            Err(e) => {
                self.stopped = true;
                Some(Err(e))
            }
        }
    }
}
