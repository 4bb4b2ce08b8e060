//! Length-aware batch formation
//!
//! Prepared rows are packed into generation batches under one of two policies:
//!
//! - **Flat**: consecutive groups of a fixed size, in arrival order.
//! - **Bracketed**: an ascending table of `(max_tokens, batch_size)` brackets.
//!   Short sequences share large batches; as sequences get longer the batch
//!   size shrinks, bounding peak memory per generation call.
//!
//! The bracketed policy never sorts. It walks a bracket pointer forward only,
//! so its input must already be sorted ascending by token count (see
//! [`flatten_and_sort`]).

use crate::messages::PreparedInputItem;
use batchgen_common::config::{Bracket, GenerationBatchSize};
use std::collections::VecDeque;
use std::mem;

/// Anything with a token length
pub trait Sequence {
    fn seq_len(&self) -> usize;
}

impl Sequence for PreparedInputItem {
    fn seq_len(&self) -> usize {
        self.token_ids.len()
    }
}

/// Consecutive groups of at most `size` elements
///
/// The last group may be shorter. Panics if `size` is zero.
pub fn simple_chunks<I: IntoIterator>(items: I, size: usize) -> SimpleChunks<I::IntoIter> {
    assert!(size > 0, "chunk size must be non-zero");
    SimpleChunks {
        items: items.into_iter(),
        size,
    }
}

/// Iterator returned by [`simple_chunks`]
pub struct SimpleChunks<I> {
    items: I,
    size: usize,
}

impl<I: Iterator> Iterator for SimpleChunks<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<_> = self.items.by_ref().take(self.size).collect();
        (!chunk.is_empty()).then_some(chunk)
    }
}

/// Pack length-sorted items into batches according to a bracket table
///
/// `brackets` must be non-empty with ascending `max_tokens`.
pub fn prediction_batches<I>(items: I, brackets: &[Bracket]) -> PredictionBatches<I::IntoIter>
where
    I: IntoIterator,
    I::Item: Sequence,
{
    assert!(!brackets.is_empty(), "bracket table must not be empty");
    PredictionBatches {
        items: items.into_iter(),
        brackets: brackets.to_vec(),
        bracket: 0,
        batch: Vec::new(),
        ready: VecDeque::new(),
    }
}

/// Iterator returned by [`prediction_batches`]
pub struct PredictionBatches<I: Iterator> {
    items: I,
    brackets: Vec<Bracket>,
    /// Current bracket; only ever moves forward
    bracket: usize,
    batch: Vec<I::Item>,
    /// Completed batches not handed out yet
    ready: VecDeque<Vec<I::Item>>,
}

impl<I> PredictionBatches<I>
where
    I: Iterator,
    I::Item: Sequence,
{
    fn is_last_bracket(&self) -> bool {
        self.bracket + 1 == self.brackets.len()
    }

    /// First later bracket that covers `len`; the last bracket absorbs anything longer
    fn covering_bracket(&self, len: usize) -> usize {
        self.brackets[self.bracket + 1..]
            .iter()
            .position(|b| len <= b.max_tokens)
            .map(|offset| self.bracket + 1 + offset)
            .unwrap_or(self.brackets.len() - 1)
    }

    fn push(&mut self, item: I::Item) {
        self.batch.push(item);
        if self.batch.len() >= self.brackets[self.bracket].batch_size {
            self.ready.push_back(mem::take(&mut self.batch));
        }
    }
}

impl<I> Iterator for PredictionBatches<I>
where
    I: Iterator,
    I::Item: Sequence,
{
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.ready.is_empty() {
            let Some(item) = self.items.next() else {
                return (!self.batch.is_empty()).then(|| mem::take(&mut self.batch));
            };

            let len = item.seq_len();
            if len > self.brackets[self.bracket].max_tokens && !self.is_last_bracket() {
                // Longer than the current bracket allows: close the batch early
                if !self.batch.is_empty() {
                    self.ready.push_back(mem::take(&mut self.batch));
                }
                self.bracket = self.covering_bracket(len);
            }
            self.push(item);
        }

        self.ready.pop_front()
    }
}

/// Batches produced by [`form_batches`]
pub enum Batches<T: Sequence> {
    Flat(SimpleChunks<std::vec::IntoIter<T>>),
    Bracketed(PredictionBatches<std::vec::IntoIter<T>>),
}

impl<T: Sequence> Iterator for Batches<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Batches::Flat(chunks) => chunks.next(),
            Batches::Bracketed(batches) => batches.next(),
        }
    }
}

/// Split prepared items into generation batches under `policy`
///
/// For a bracketed policy the items must be sorted ascending by length.
pub fn form_batches<T: Sequence>(items: Vec<T>, policy: &GenerationBatchSize) -> Batches<T> {
    match policy {
        GenerationBatchSize::Flat(size) => Batches::Flat(simple_chunks(items, *size)),
        GenerationBatchSize::Bracketed(brackets) => {
            Batches::Bracketed(prediction_batches(items, brackets))
        }
    }
}

/// Flatten batches into one sequence sorted ascending by length
pub fn flatten_and_sort<T, B>(batches: B) -> Vec<T>
where
    T: Sequence,
    B: IntoIterator<Item = Vec<T>>,
{
    let mut items: Vec<T> = batches.into_iter().flatten().collect();
    items.sort_by_key(Sequence::seq_len);
    items
}

/// Flatten a stream of fallible batches into a stream of fallible items
///
/// A failed batch is yielded as a single `Err` in its place.
pub fn flatten<I, T, E>(batches: I) -> Flatten<I::IntoIter, T>
where
    I: IntoIterator<Item = Result<Vec<T>, E>>,
{
    Flatten {
        batches: batches.into_iter(),
        current: Vec::new().into_iter(),
    }
}

/// Iterator returned by [`flatten`]
pub struct Flatten<I, T> {
    batches: I,
    current: std::vec::IntoIter<T>,
}

impl<I, T, E> Iterator for Flatten<I, T>
where
    I: Iterator<Item = Result<Vec<T>, E>>,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }
            match self.batches.next()? {
                Ok(batch) => self.current = batch.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Yield the `Ok` values of `items` until the first `Err`
///
/// The error is parked in `slot` and the stream ends. Callers check the slot
/// once the stream has been consumed.
pub fn until_error<I, T, E>(items: I, slot: &mut Option<E>) -> UntilError<'_, I::IntoIter, E>
where
    I: IntoIterator<Item = Result<T, E>>,
{
    UntilError {
        items: items.into_iter(),
        slot,
    }
}

/// Iterator returned by [`until_error`]
pub struct UntilError<'a, I, E> {
    items: I,
    slot: &'a mut Option<E>,
}

impl<'a, I, T, E> Iterator for UntilError<'a, I, E>
where
    I: Iterator<Item = Result<T, E>>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.slot.is_some() {
            return None;
        }
        match self.items.next()? {
            Ok(item) => Some(item),
            Err(e) => {
                *self.slot = Some(e);
                None
            }
        }
    }
}
