use crossbeam_channel::{Receiver, Select, Sender, TrySendError};
use log::trace;
use std::time::{Duration, Instant};

/// Priority of [`PriorityQueue::add`]: the middle lane.
pub const MID_PRI: i8 = 0;

/// Error returned when an item cannot be queued. The item is handed back.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError<T> {
    /// The lane the item maps to is at capacity.
    #[error("priority queue lane {lane} is full, can't add item")]
    Full {
        /// The rejected item.
        item: T,
        /// Index of the full lane.
        lane: usize,
    },
}

impl<T> QueueError<T> {
    /// Takes back the item that could not be queued.
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full { item, .. } => item,
        }
    }
}

struct Lane<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

/// Bounded multi-producer multi-consumer queue with several priority lanes.
///
/// Every lane holds up to `capacity` items and is FIFO. [`take`](PriorityQueue::take)
/// always serves the highest non-empty lane first and blocks while every lane is
/// empty. Adding never blocks; a full lane rejects the item with [`QueueError::Full`].
///
/// Priorities are offsets from the middle lane: `0` is the middle, positive values
/// are more urgent and negative values less urgent. Offsets beyond the available
/// lanes are clamped.
///
/// ```rust
/// use tether_executor::PriorityQueue;
///
/// let queue = PriorityQueue::new(3, 16);
/// queue.add("normal")?;
/// queue.add_with_priority("low", -1)?;
/// queue.add_with_priority("high", 1)?;
///
/// assert_eq!(queue.take(), "high");
/// assert_eq!(queue.take(), "normal");
/// assert_eq!(queue.take(), "low");
/// # Ok::<(), tether_executor::QueueError<&str>>(())
/// ```
pub struct PriorityQueue<T> {
    lanes: Vec<Lane<T>>,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    /// Creates a queue with `num_priorities` lanes of `capacity` items each.
    ///
    /// Both values are raised to at least one.
    pub fn new(num_priorities: u8, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let lanes = (0..num_priorities.max(1))
            .map(|_| {
                let (tx, rx) = crossbeam_channel::bounded(capacity);
                Lane { tx, rx }
            })
            .collect();
        Self { lanes, capacity }
    }

    /// Number of priority lanes.
    pub fn num_priorities(&self) -> u8 {
        self.lanes.len() as u8
    }

    /// Capacity of each lane.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.rx.len()).sum()
    }

    /// Whether no item is queued.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.rx.is_empty())
    }

    /// Lane index for a priority offset from the middle lane.
    pub fn lane_for(&self, priority: i8) -> usize {
        let mid = self.lanes.len() as i64 / 2;
        let highest = self.lanes.len() as i64 - 1;
        (mid + i64::from(priority)).clamp(0, highest) as usize
    }

    /// Queues `item` at the middle priority.
    pub fn add(&self, item: T) -> Result<(), QueueError<T>> {
        self.add_with_priority(item, MID_PRI)
    }

    /// Queues `item` at `priority`, an offset from the middle lane.
    pub fn add_with_priority(&self, item: T, priority: i8) -> Result<(), QueueError<T>> {
        let lane = self.lane_for(priority);
        match self.lanes[lane].tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                trace!("lane {} full, rejecting item", lane);
                Err(QueueError::Full { item, lane })
            }
        }
    }

    /// Removes the oldest item of the highest non-empty lane, if any.
    pub fn try_take(&self) -> Option<T> {
        self.lanes
            .iter()
            .rev()
            .find_map(|lane| lane.rx.try_recv().ok())
    }

    /// Removes the oldest item of the highest non-empty lane, blocking until
    /// one is available.
    pub fn take(&self) -> T {
        loop {
            if let Some(item) = self.try_take() {
                return item;
            }
            self.select().ready();
        }
    }

    /// Like [`take`](PriorityQueue::take), giving up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_take() {
                return Some(item);
            }
            if self.select().ready_deadline(deadline).is_err() {
                return self.try_take();
            }
        }
    }

    fn select(&self) -> Select<'_> {
        let mut select = Select::new();
        for lane in &self.lanes {
            select.recv(&lane.rx);
        }
        select
    }
}
