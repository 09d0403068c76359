//! Bounded diagnostics for the feed processor.
//!
//! The processor records what happened on its lease into a fixed-size ring
//! buffer. Old events are evicted, so tracing a long-running pump costs
//! constant memory.

use crate::clock::Clock;
use crate::observer::CloseReason;
use leasefeed_protocol::ContinuationToken;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Fixed-capacity FIFO that evicts its oldest element when full.
///
/// Starts as a growing vector. The insert that would exceed capacity turns
/// the vector into a circular buffer once; from then on inserts are O(1).
#[derive(Debug, Clone)]
pub struct BoundedRingBuffer<T> {
    capacity: usize,
    backing: Backing<T>,
}

#[derive(Debug, Clone)]
enum Backing<T> {
    Growing(Vec<T>),
    Circular(CircularBuffer<T>),
}

impl<T> BoundedRingBuffer<T> {
    /// Creates a buffer holding at most `capacity` elements (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            backing: Backing::Growing(Vec::with_capacity(capacity)),
        }
    }

    /// Returns the maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an element, evicting the oldest one if full.
    pub fn push(&mut self, item: T) {
        match &mut self.backing {
            Backing::Growing(items) if items.len() < self.capacity => items.push(item),
            Backing::Growing(items) => {
                let mut buffer =
                    CircularBuffer::from_items(std::mem::take(items), self.capacity);
                buffer.push(item);
                self.backing = Backing::Circular(buffer);
            }
            Backing::Circular(buffer) => buffer.push(item),
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Growing(items) => items.len(),
            Backing::Circular(buffer) => buffer.len(),
        }
    }

    /// Returns true if the next insert evicts an element.
    pub fn is_full(&self) -> bool {
        match &self.backing {
            Backing::Growing(items) => items.len() == self.capacity,
            Backing::Circular(buffer) => buffer.is_full(),
        }
    }

    /// Returns true if no element is stored.
    pub fn is_empty(&self) -> bool {
        match &self.backing {
            Backing::Growing(items) => items.is_empty(),
            Backing::Circular(buffer) => buffer.is_empty(),
        }
    }

    /// Iterates from oldest to newest.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        match &self.backing {
            Backing::Growing(items) => Box::new(items.iter()),
            Backing::Circular(buffer) => Box::new(buffer.iter()),
        }
    }
}

impl<T: Clone> BoundedRingBuffer<T> {
    /// Copies the elements, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

/// Circular storage with one spare slot so that `head == tail` means empty.
#[derive(Debug, Clone)]
struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

impl<T> CircularBuffer<T> {
    fn from_items(items: Vec<T>, capacity: usize) -> Self {
        let mut slots: Vec<Option<T>> = Vec::with_capacity(capacity + 1);
        slots.extend(items.into_iter().map(Some));
        let tail = slots.len();
        slots.resize_with(capacity + 1, || None);
        Self {
            slots,
            head: 0,
            tail,
        }
    }

    fn push(&mut self, item: T) {
        if self.is_full() {
            self.slots[self.head] = None;
            self.head = (self.head + 1) % self.slots.len();
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
    }

    fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.slots.len() == self.head
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let slots = self.slots.len();
        (0..self.len()).filter_map(move |i| self.slots[(self.head + i) % slots].as_ref())
    }
}

/// A ring buffer shared between a writer and any number of readers.
///
/// Readers take a snapshot under a read lock, so an insert racing with a
/// read never invalidates the reader's view.
#[derive(Debug)]
pub struct SharedRingBuffer<T> {
    inner: Arc<RwLock<BoundedRingBuffer<T>>>,
}

impl<T> Clone for SharedRingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> SharedRingBuffer<T> {
    /// Creates a shared buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoundedRingBuffer::new(capacity))),
        }
    }

    /// Appends an element.
    pub fn push(&self, item: T) {
        self.inner.write().push(item);
    }

    /// Copies the elements, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.read().snapshot()
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if no element is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Returns true if the next insert evicts an element.
    pub fn is_full(&self) -> bool {
        self.inner.read().is_full()
    }
}

/// Something the processor observed on its lease.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    /// A page with documents arrived.
    PageReceived {
        /// Number of documents.
        documents: usize,
        /// Cost of the read.
        request_charge: f64,
        /// Server-side identifier of the read.
        activity_id: String,
    },
    /// The store reported no changes.
    NotModified {
        /// Server-side identifier of the read.
        activity_id: String,
    },
    /// A read failed with a retryable error.
    TransientFailure {
        /// Raw status code.
        status: u16,
        /// Raw sub-status code.
        sub_status: u32,
        /// Consecutive failure count.
        attempt: u32,
    },
    /// The page size was reduced after a rejection.
    PageSizeReduced {
        /// New page size.
        max_item_count: u32,
    },
    /// The position was persisted.
    Checkpointed {
        /// Persisted continuation.
        continuation: ContinuationToken,
    },
    /// The observer was closed.
    Closed {
        /// Close reason.
        reason: CloseReason,
    },
}

/// A timestamped diagnostic entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    /// When the event was recorded.
    pub at: Instant,
    /// What happened.
    pub kind: DiagnosticKind,
}

/// Diagnostic recorder handed to the processor components.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    events: SharedRingBuffer<DiagnosticEvent>,
    clock: Arc<dyn Clock>,
}

impl Diagnostics {
    /// Creates a recorder keeping `capacity` events.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            events: SharedRingBuffer::new(capacity),
            clock,
        }
    }

    /// Records an event.
    pub fn record(&self, kind: DiagnosticKind) {
        self.events.push(DiagnosticEvent {
            at: self.clock.now(),
            kind,
        });
    }

    /// Returns the retained events, oldest first.
    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events.snapshot()
    }
}
