//! Typed binary record stores
//!
//! Every in-memory index the ledger keeps (block times, miner coin counts,
//! spent outputs, transaction locations, the free pool) lives in one of the
//! containers below. The backing buffer is the exact byte image written to
//! the cache files, so `as_bytes` / `from_bytes` round trip byte for byte.
//!
//! - [`FixedRecordStore`]: every record has the same width.
//! - [`ScalableRecordStore`]: records carry variable-length fields, each
//!   record is framed by a 4-byte big-endian length.
//! - [`SortedRecordStore`]: a fixed store kept ordered by a binary key.

use crate::error::{BlockchainError, Result};
use std::iter::FusedIterator;
use std::marker::PhantomData;

const DEFAULT_STEP: usize = 64;

/// A record with a fixed on-disk width.
pub trait FixedRecord: Sized {
    const SIZE: usize;

    /// Writes exactly `SIZE` bytes into `out`.
    fn write_to(&self, out: &mut [u8]);

    /// Reads a record from exactly `SIZE` bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

/// A record with at least one variable-length field.
pub trait ScalableRecord: Sized {
    fn encoded_len(&self) -> usize;

    fn write_to(&self, out: &mut Vec<u8>);

    fn read_from(bytes: &[u8]) -> Result<Self>;
}

/// Records kept in binary order by a key.
pub trait SortedRecord: FixedRecord {
    type Key: Ord;

    fn key(&self) -> Self::Key;
}

/// Grows `buffer` so it can hold `needed` bytes, at least doubling the
/// capacity (and never by less than `step` bytes) whenever it runs out.
fn grow_for(buffer: &mut Vec<u8>, needed: usize, step: usize) {
    let capacity = buffer.capacity();
    if needed <= capacity {
        return;
    }
    let target = needed.max(capacity * 2).max(capacity + step);
    buffer.reserve_exact(target - buffer.len());
}

#[derive(Clone)]
pub struct FixedRecordStore<R> {
    buffer: Vec<u8>,
    step: usize,
    _record: PhantomData<R>,
}

impl<R: FixedRecord> Default for FixedRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: FixedRecord> FixedRecordStore<R> {
    pub fn new() -> Self {
        Self::with_step(DEFAULT_STEP)
    }

    /// `step` is the minimum number of records added when the store grows
    pub fn with_step(step: usize) -> Self {
        FixedRecordStore {
            buffer: Vec::new(),
            step: step.max(1) * R::SIZE,
            _record: PhantomData,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % R::SIZE != 0 {
            return Err(BlockchainError::CacheCorrupted(format!(
                "{} bytes is not a multiple of the {}-byte record width",
                bytes.len(),
                R::SIZE
            )));
        }
        let mut store = Self::new();
        grow_for(&mut store.buffer, bytes.len(), store.step);
        store.buffer.extend_from_slice(bytes);
        Ok(store)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len() / R::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Raw bytes of the records from `index` to the end
    pub fn bytes_from(&self, index: usize) -> &[u8] {
        let start = (index * R::SIZE).min(self.buffer.len());
        &self.buffer[start..]
    }

    pub fn push(&mut self, item: &R) -> &[u8] {
        let start = self.buffer.len();
        grow_for(&mut self.buffer, start + R::SIZE, self.step);
        self.buffer.resize(start + R::SIZE, 0);
        item.write_to(&mut self.buffer[start..]);
        &self.buffer[start..]
    }

    /// Inserts before `index`, shifting later records right. An index past the
    /// end appends.
    pub fn insert(&mut self, index: usize, item: &R) -> &[u8] {
        if index >= self.len() {
            return self.push(item);
        }
        let start = index * R::SIZE;
        let mut raw = vec![0u8; R::SIZE];
        item.write_to(&mut raw);
        let needed = self.buffer.len() + R::SIZE;
        grow_for(&mut self.buffer, needed, self.step);
        self.buffer.splice(start..start, raw);
        &self.buffer[start..start + R::SIZE]
    }

    pub fn get(&self, index: usize) -> Option<R> {
        self.raw(index).map(R::read_from)
    }

    pub fn first(&self) -> Option<R> {
        self.get(0)
    }

    pub fn last(&self) -> Option<R> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(R::SIZE)?;
        self.buffer.get(start..start + R::SIZE)
    }

    /// Linear scan for the first record matching `predicate`
    pub fn position<P: FnMut(&R) -> bool>(&self, mut predicate: P) -> Option<usize> {
        self.iter().position(|record| predicate(&record))
    }

    /// Overwrites the record at `index`, returning the previous one
    pub fn replace(&mut self, index: usize, item: &R) -> Option<R> {
        let previous = self.get(index)?;
        let start = index * R::SIZE;
        item.write_to(&mut self.buffer[start..start + R::SIZE]);
        Some(previous)
    }

    /// Removes the record at `index`, shifting later records left
    pub fn remove(&mut self, index: usize) -> Option<R> {
        let previous = self.get(index)?;
        let start = index * R::SIZE;
        self.buffer.drain(start..start + R::SIZE);
        Some(previous)
    }

    /// Keeps only the records matching `predicate`, compacting in place
    pub fn retain<P: FnMut(&R) -> bool>(&mut self, mut predicate: P) {
        let count = self.len();
        let mut write = 0;
        for read in 0..count {
            let start = read * R::SIZE;
            let record = R::read_from(&self.buffer[start..start + R::SIZE]);
            if predicate(&record) {
                if write != read {
                    self.buffer
                        .copy_within(start..start + R::SIZE, write * R::SIZE);
                }
                write += 1;
            }
        }
        self.buffer.truncate(write * R::SIZE);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len * R::SIZE);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Double-ended iterator; use `.rev()` for a reverse scan and `find`,
    /// `find_map` or `break` to stop early.
    pub fn iter(&self) -> RecordIter<'_, R> {
        RecordIter {
            buffer: &self.buffer,
            front: 0,
            back: self.len(),
            _record: PhantomData,
        }
    }
}

pub struct RecordIter<'a, R> {
    buffer: &'a [u8],
    front: usize,
    back: usize,
    _record: PhantomData<R>,
}

impl<R: FixedRecord> Iterator for RecordIter<'_, R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        if self.front >= self.back {
            return None;
        }
        let start = self.front * R::SIZE;
        self.front += 1;
        Some(R::read_from(&self.buffer[start..start + R::SIZE]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.back - self.front;
        (left, Some(left))
    }

    fn nth(&mut self, n: usize) -> Option<R> {
        self.front = self.front.saturating_add(n).min(self.back);
        self.next()
    }
}

impl<R: FixedRecord> DoubleEndedIterator for RecordIter<'_, R> {
    fn next_back(&mut self) -> Option<R> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        let start = self.back * R::SIZE;
        Some(R::read_from(&self.buffer[start..start + R::SIZE]))
    }
}

impl<R: FixedRecord> ExactSizeIterator for RecordIter<'_, R> {}

impl<R: FixedRecord> FusedIterator for RecordIter<'_, R> {}

/// Store for records with variable-length fields.
///
/// Layout: `[len(4, BE) | record bytes]` repeated. `spans` caches the start
/// and length of every record body so lookups stay O(1).
#[derive(Clone)]
pub struct ScalableRecordStore<R> {
    buffer: Vec<u8>,
    spans: Vec<(usize, usize)>,
    step: usize,
    _record: PhantomData<R>,
}

impl<R: ScalableRecord> Default for ScalableRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: ScalableRecord> ScalableRecordStore<R> {
    pub fn new() -> Self {
        ScalableRecordStore {
            buffer: Vec::new(),
            spans: Vec::new(),
            step: DEFAULT_STEP * 16,
            _record: PhantomData,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut store = Self::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes.len() - pos < 4 {
                return Err(BlockchainError::CacheCorrupted(
                    "truncated record length".to_string(),
                ));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[pos..pos + 4]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            if bytes.len() - pos - 4 < len {
                return Err(BlockchainError::CacheCorrupted(
                    "truncated record body".to_string(),
                ));
            }
            R::read_from(&bytes[pos + 4..pos + 4 + len])?;
            store.spans.push((pos + 4, len));
            pos += 4 + len;
        }
        store.buffer.extend_from_slice(bytes);
        Ok(store)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn encode(item: &R) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(4 + item.encoded_len());
        body.extend_from_slice(&[0u8; 4]);
        item.write_to(&mut body);
        let len = u32::try_from(body.len() - 4).map_err(|_| {
            BlockchainError::Serialization("record larger than 4 GiB".to_string())
        })?;
        body[..4].copy_from_slice(&len.to_be_bytes());
        Ok(body)
    }

    pub fn push(&mut self, item: &R) -> Result<&[u8]> {
        let framed = Self::encode(item)?;
        let start = self.buffer.len();
        grow_for(&mut self.buffer, start + framed.len(), self.step);
        self.buffer.extend_from_slice(&framed);
        self.spans.push((start + 4, framed.len() - 4));
        Ok(&self.buffer[start + 4..])
    }

    pub fn insert(&mut self, index: usize, item: &R) -> Result<&[u8]> {
        if index >= self.len() {
            return self.push(item);
        }
        let framed = Self::encode(item)?;
        let at = self.spans[index].0 - 4;
        let shift = framed.len();
        let needed = self.buffer.len() + shift;
        grow_for(&mut self.buffer, needed, self.step);
        self.buffer.splice(at..at, framed);
        for span in self.spans.iter_mut().skip(index) {
            span.0 += shift;
        }
        self.spans.insert(index, (at + 4, shift - 4));
        Ok(&self.buffer[at + 4..at + shift])
    }

    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        let (start, len) = *self.spans.get(index)?;
        Some(&self.buffer[start..start + len])
    }

    pub fn get(&self, index: usize) -> Option<R> {
        self.raw(index).and_then(|raw| R::read_from(raw).ok())
    }

    pub fn position<P: FnMut(&R) -> bool>(&self, mut predicate: P) -> Option<usize> {
        self.iter().position(|record| predicate(&record))
    }

    pub fn replace(&mut self, index: usize, item: &R) -> Result<Option<R>> {
        let Some(previous) = self.get(index) else {
            return Ok(None);
        };
        self.remove(index);
        self.insert(index, item)?;
        Ok(Some(previous))
    }

    pub fn remove(&mut self, index: usize) -> Option<R> {
        let previous = self.get(index)?;
        let (start, len) = self.spans.remove(index);
        self.buffer.drain(start - 4..start + len);
        for span in self.spans.iter_mut().skip(index) {
            span.0 -= len + 4;
        }
        Some(previous)
    }

    pub fn retain<P: FnMut(&R) -> bool>(&mut self, mut predicate: P) {
        let mut buffer = Vec::with_capacity(self.buffer.capacity());
        let mut spans = Vec::with_capacity(self.spans.len());
        for &(start, len) in &self.spans {
            let keep = R::read_from(&self.buffer[start..start + len])
                .map(|record| predicate(&record))
                .unwrap_or(false);
            if keep {
                spans.push((buffer.len() + 4, len));
                buffer.extend_from_slice(&self.buffer[start - 4..start + len]);
            }
        }
        self.buffer = buffer;
        self.spans = spans;
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.spans.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = R> + '_ {
        self.spans
            .iter()
            .filter_map(move |&(start, len)| R::read_from(&self.buffer[start..start + len]).ok())
    }
}

/// Fixed-width store kept in ascending key order. Records with equal keys
/// keep their insertion order.
#[derive(Clone)]
pub struct SortedRecordStore<R> {
    inner: FixedRecordStore<R>,
}

impl<R: SortedRecord> Default for SortedRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: SortedRecord> SortedRecordStore<R> {
    pub fn new() -> Self {
        SortedRecordStore {
            inner: FixedRecordStore::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = FixedRecordStore::<R>::from_bytes(bytes)?;
        let mut previous: Option<R::Key> = None;
        for record in inner.iter() {
            let key = record.key();
            if previous.as_ref().is_some_and(|p| *p > key) {
                return Err(BlockchainError::CacheCorrupted(
                    "sorted cache out of order".to_string(),
                ));
            }
            previous = Some(key);
        }
        Ok(SortedRecordStore { inner })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<R> {
        self.inner.get(index)
    }

    /// Index right after the last record whose key is `<= key`
    pub fn insertion_index_for(&self, key: &R::Key) -> usize {
        let (mut low, mut high) = (0, self.inner.len());
        while low < high {
            let mid = (low + high) / 2;
            match self.inner.get(mid) {
                Some(record) if record.key() <= *key => low = mid + 1,
                _ => high = mid,
            }
        }
        low
    }

    fn lower_bound(&self, key: &R::Key) -> usize {
        let (mut low, mut high) = (0, self.inner.len());
        while low < high {
            let mid = (low + high) / 2;
            match self.inner.get(mid) {
                Some(record) if record.key() < *key => low = mid + 1,
                _ => high = mid,
            }
        }
        low
    }

    pub fn all_indexes_equal_to(&self, key: &R::Key) -> Vec<usize> {
        let start = self.lower_bound(key);
        self.inner
            .iter()
            .skip(start)
            .take_while(|record| record.key() == *key)
            .enumerate()
            .map(|(offset, _)| start + offset)
            .collect()
    }

    pub fn all_equal_to(&self, key: &R::Key) -> Vec<R> {
        let start = self.lower_bound(key);
        self.inner
            .iter()
            .skip(start)
            .take_while(|record| record.key() == *key)
            .collect()
    }

    pub fn insert(&mut self, item: &R) -> usize {
        let index = self.insertion_index_for(&item.key());
        self.inner.insert(index, item);
        index
    }

    pub fn remove(&mut self, index: usize) -> Option<R> {
        self.inner.remove(index)
    }

    pub fn retain<P: FnMut(&R) -> bool>(&mut self, predicate: P) {
        self.inner.retain(predicate)
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    pub fn iter(&self) -> RecordIter<'_, R> {
        self.inner.iter()
    }
}
