//! Lazy row reading and staged writes

use std::collections::VecDeque;

use serde_json::Value as Json;

use super::{Storage, StorageResult};
use crate::mapper::{self, Record};
use crate::schema::{Descriptor, Row};
use crate::transport::{Request, Transport};

/// Lazy, single-pass iterator over the rows of a bucket
///
/// Pages are fetched on demand, following the DataStore's next-page link
/// until a page comes back empty.
pub struct RowIter<'a, T: Transport> {
    storage: &'a Storage<T>,
    descriptor: Descriptor,
    pending: Option<Request>,
    buffer: VecDeque<Record>,
}

impl<'a, T: Transport> RowIter<'a, T> {
    pub(super) fn new(storage: &'a Storage<T>, descriptor: Descriptor, first: Request) -> Self {
        Self {
            storage,
            descriptor,
            pending: Some(first),
            buffer: VecDeque::new(),
        }
    }

    /// Schema the rows are cast with
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

impl<T: Transport> Iterator for RowIter<'_, T> {
    type Item = StorageResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(mapper::cast_record(&record, &self.descriptor));
            }

            let request = self.pending.take()?;
            match self.storage.fetch_page(request) {
                Ok(page) => {
                    if page.records.is_empty() {
                        return None;
                    }
                    self.pending = page.next_request(self.storage.base_url());
                    self.buffer.extend(page.records);
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Records converted for a bucket but not yet sent
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    pub(super) bucket: String,
    pub(super) records: Vec<Record>,
}

impl PreparedWrite {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Streaming write: yields each input row unchanged while converting it
///
/// The upsert call is issued once the input is exhausted, so the write only
/// happens if the stream is drained.
pub struct WriteStream<'a, T: Transport, I: Iterator> {
    storage: &'a Storage<T>,
    descriptor: Descriptor,
    bucket: String,
    method: String,
    rows: I,
    records: Vec<Record>,
    finished: bool,
}

impl<'a, T: Transport, I: Iterator> WriteStream<'a, T, I> {
    pub(super) fn new(
        storage: &'a Storage<T>,
        descriptor: Descriptor,
        bucket: &str,
        method: &str,
        rows: I,
    ) -> Self {
        Self {
            storage,
            descriptor,
            bucket: bucket.to_string(),
            method: method.to_string(),
            rows,
            records: Vec::new(),
            finished: false,
        }
    }

    /// Records converted so far
    pub fn converted(&self) -> &[Record] {
        &self.records
    }

    /// Whether the upsert has been attempted
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<T, I> Iterator for WriteStream<'_, T, I>
where
    T: Transport,
    I: Iterator,
    I::Item: AsRef<[Json]>,
{
    type Item = StorageResult<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.rows.next() {
            Some(row) => {
                self.records
                    .push(mapper::uncast_row(row.as_ref(), &self.descriptor));
                Some(Ok(row))
            }
            None => {
                self.finished = true;
                let prepared = PreparedWrite {
                    bucket: std::mem::take(&mut self.bucket),
                    records: std::mem::take(&mut self.records),
                };
                self.storage.commit(prepared, &self.method).err().map(Err)
            }
        }
    }
}
