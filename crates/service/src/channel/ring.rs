use bytes::Bytes;

use crate::{Error, Result};

/// Bounded per-channel receive ring.
///
/// Inbound data messages are stored between `tail` and `head`; a parallel
/// `inuse` table tracks buffers currently lent to the consumer and awaiting
/// an explicit release. `count` is bounded by the ring capacity on its own:
/// the ring keeps accepting messages while it has room even when the
/// consumer is sitting on a full `inuse` table, the consumer is simply
/// refused further fetches until it releases something.
///
/// # Test
///
/// ```
/// use bytes::Bytes;
/// use chanmux_service::channel::RxRing;
///
/// let mut ring = RxRing::new(2);
///
/// ring.push(Bytes::from_static(b"a")).unwrap();
/// ring.push(Bytes::from_static(b"b")).unwrap();
/// assert!(ring.push(Bytes::from_static(b"c")).is_err());
///
/// let first = ring.pop().unwrap();
/// assert_eq!(&first[..], b"a");
/// assert_eq!(ring.count(), 1);
/// assert_eq!(ring.inuse_count(), 1);
///
/// ring.release(&first).unwrap();
/// assert_eq!(ring.inuse_count(), 0);
/// ```
pub struct RxRing {
    ring: Vec<Option<Bytes>>,
    inuse: Vec<Option<Bytes>>,
    head: usize,
    tail: usize,
    count: usize,
    inuse_count: usize,
}

impl RxRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            ring: vec![None; capacity],
            inuse: vec![None; capacity],
            head: 0,
            tail: 0,
            count: 0,
            inuse_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn inuse_count(&self) -> usize {
        self.inuse_count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The consumer holds every slot; fetches must wait for a release.
    pub fn inuse_full(&self) -> bool {
        self.inuse_count == self.ring.len()
    }

    /// Store one inbound message. `NoMemory` when the ring is full; the
    /// caller drops the buffer in that case.
    pub fn push(&mut self, buf: Bytes) -> Result<()> {
        if self.count == self.ring.len() {
            return Err(Error::NoMemory);
        }

        self.ring[self.head] = Some(buf);
        self.head = (self.head + 1) % self.ring.len();
        self.count += 1;
        Ok(())
    }

    /// Dequeue the oldest message and lend it to the consumer, recording it
    /// in the first free `inuse` slot. The caller must have checked
    /// [`inuse_full`](Self::inuse_full) first.
    pub fn pop(&mut self) -> Option<Bytes> {
        if self.count == 0 {
            return None;
        }

        let buf = self.ring[self.tail].take()?;
        self.tail = (self.tail + 1) % self.ring.len();
        self.count -= 1;

        let slot = self
            .inuse
            .iter()
            .position(|entry| entry.is_none())
            .expect("receive ring in-use table has no free slot");

        self.inuse[slot] = Some(buf.clone());
        self.inuse_count += 1;
        Some(buf)
    }

    /// Give back a buffer obtained from [`pop`](Self::pop). Matching is by
    /// allocation identity, `Invalid` when the buffer was never lent out.
    pub fn release(&mut self, buf: &Bytes) -> Result<()> {
        let slot = self
            .inuse
            .iter()
            .position(|entry| {
                entry
                    .as_ref()
                    .map(|lent| lent.as_ptr() == buf.as_ptr() && lent.len() == buf.len())
                    .unwrap_or(false)
            })
            .ok_or(Error::Invalid)?;

        self.inuse[slot] = None;
        self.inuse_count -= 1;
        Ok(())
    }
}
