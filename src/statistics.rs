use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    Connected(usize),
    Accepted(usize),
    Closed(usize),
    DroppedPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

/// # Example
///
/// ```
/// use chanmux::statistics::{Count, Number};
///
/// let count = Count::default();
///
/// count.add(1);
/// assert_eq!(count.get(), 1);
///
/// count.add(1);
/// assert_eq!(count.get(), 2);
/// ```
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Counts<T> {
    pub connected: T,
    pub accepted: T,
    pub closed: T,
    pub dropped_pkts: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::Connected(v) => self.connected.add(*v),
            Stats::Accepted(v) => self.accepted.add(*v),
            Stats::Closed(v) => self.closed.add(*v),
            Stats::DroppedPkts(v) => self.dropped_pkts.add(*v),
        }
    }
}

/// Engine-wide channel accounting.
///
/// # Example
///
/// ```
/// use chanmux::statistics::{Number, Statistics, Stats};
///
/// let statistics = Statistics::default();
///
/// statistics.add(&Stats::Connected(1));
/// statistics.add(&Stats::Closed(1));
///
/// assert_eq!(statistics.total().connected.get(), 1);
/// assert_eq!(statistics.total().closed.get(), 1);
/// assert_eq!(statistics.total().dropped_pkts.get(), 0);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts<Count>>);

impl Statistics {
    pub fn add(&self, payload: &Stats) {
        self.0.add(payload);
    }

    pub fn total(&self) -> &Counts<Count> {
        &self.0
    }
}
