//! The radio event scheduler.
//!
//! Every activity that needs the radio (an advertising PDU, a scan window) is represented by a
//! [`SchedItem`] occupying the time window `[start, end)`. The scheduler keeps queued items sorted
//! by start time and guarantees that no two of them overlap. It owns the platform's one-shot
//! [`Timer`], which is always armed for the earliest pending wakeup.
//!
//! When the timer fires, [`Scheduler::run`] invokes the handler for every item whose wakeup time
//! has passed. The handler returns [`SchedStatus::Done`] to free the item, or
//! [`SchedStatus::Running`] to keep it queued until its (possibly updated) `next_wakeup`. The
//! latter is used when an activity needs to be told when its time slot is over, for example to
//! wait for a scan request after an advertising PDU was sent.
//!
//! Items come from a fixed pool. Running out of items or hitting an overlap are the only ways
//! adding an item can fail, and both are reported to the caller instead of being treated as fatal.
//!
//! [`SchedItem`]: struct.SchedItem.html
//! [`Timer`]: ../time/trait.Timer.html
//! [`Scheduler::run`]: struct.Scheduler.html#method.run
//! [`SchedStatus::Done`]: enum.SchedStatus.html#variant.Done
//! [`SchedStatus::Running`]: enum.SchedStatus.html#variant.Running

use crate::{
    time::{Instant, Timer},
    Error,
};
use heapless::Vec;

/// The kind of activity a schedule item belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedType {
    Adv,
    Scan,
}

/// Handler to invoke when a schedule item's wakeup time is reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedCb {
    /// Transmit the current advertising PDU.
    AdvTxStart,
    /// The advertising PDU's time slot (including a possible scan request/response) is over.
    AdvTxDone,
    /// Start receiving on the current scan channel.
    ScanWindowStart,
    /// The scan window is over.
    ScanWindowEnd,
}

/// Result of a schedule item's handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedStatus {
    /// The activity is finished, the item is freed.
    Done,

    /// The activity is still in progress. The item stays at the head of the queue and the
    /// scheduler wakes up again at its `next_wakeup`.
    Running,
}

/// One future radio activity.
#[derive(Copy, Clone, Debug)]
pub struct SchedItem {
    /// Start of the reserved time window.
    pub start: Instant,

    /// End of the reserved time window (exclusive).
    pub end: Instant,

    /// When the handler should be invoked next. Set to `start` when the item is added.
    pub next_wakeup: Instant,

    pub sched_type: SchedType,
    pub cb: SchedCb,

    /// Opaque value for use by the handler.
    pub arg: u32,
}

impl SchedItem {
    fn zeroed() -> Self {
        let zero = Instant::from_raw_micros(0);
        Self {
            start: zero,
            end: zero,
            next_wakeup: zero,
            sched_type: SchedType::Adv,
            cb: SchedCb::AdvTxStart,
            arg: 0,
        }
    }

    /// Returns whether the windows of `self` and `other` intersect.
    fn overlaps(&self, other: &SchedItem) -> bool {
        if self.start.is_before(other.start) {
            other.start.is_before(self.end)
        } else {
            self.start.is_before(other.end)
        }
    }
}

/// Handle to an item in the scheduler's pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ItemId(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
    Queued,
}

#[derive(Copy, Clone)]
struct Slot {
    item: SchedItem,
    state: SlotState,
}

/// Time-ordered queue of radio activities backed by a pool of `N` items.
pub struct Scheduler<const N: usize> {
    slots: [Slot; N],

    /// Queued items, sorted by start time.
    queue: Vec<ItemId, N>,

    /// Extra wakeup requested outside of the queue (used to retry failed scheduling).
    fallback: Option<Instant>,

    /// Earliest control procedure response deadline of all connections.
    deadline: Option<Instant>,
}

impl<const N: usize> Scheduler<N> {
    pub fn new() -> Self {
        Self {
            slots: [Slot {
                item: SchedItem::zeroed(),
                state: SlotState::Free,
            }; N],
            queue: Vec::new(),
            fallback: None,
            deadline: None,
        }
    }

    /// Takes a zeroed item from the pool.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn get_item(&mut self) -> Option<ItemId> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)?;
        let slot = &mut self.slots[index];
        slot.item = SchedItem::zeroed();
        slot.state = SlotState::Allocated;
        Some(ItemId(index))
    }

    /// Returns an item that is not queued to the pool.
    ///
    /// Queued items are freed by `run` and `remove_all`; calling this on them has no effect.
    pub fn free_item(&mut self, id: ItemId) {
        let slot = &mut self.slots[id.0];
        if slot.state == SlotState::Allocated {
            slot.state = SlotState::Free;
        }
    }

    pub fn item(&self, id: ItemId) -> &SchedItem {
        &self.slots[id.0].item
    }

    pub fn item_mut(&mut self, id: ItemId) -> &mut SchedItem {
        &mut self.slots[id.0].item
    }

    /// Inserts an allocated item into the queue, in start time order.
    ///
    /// If the item's window intersects that of a queued item, `Error::Overlap` is returned and the
    /// queue is not modified. The item then still belongs to the caller, who may adjust and re-add
    /// it or free it.
    ///
    /// If the item becomes the new head of the queue, the timer is re-armed for its start time.
    pub fn add<T: Timer>(&mut self, id: ItemId, timer: &mut T) -> Result<(), Error> {
        if self.slots[id.0].state != SlotState::Allocated {
            return Err(Error::InvalidValue);
        }

        let new = {
            let item = &mut self.slots[id.0].item;
            item.next_wakeup = item.start;
            *item
        };

        let mut pos = self.queue.len();
        for (i, other) in self.queue.iter().enumerate() {
            let entry = &self.slots[other.0].item;
            if new.overlaps(entry) {
                trace!("sched: {:?} overlaps {:?}", new, entry);
                return Err(Error::Overlap);
            }
            if new.start.is_before(entry.start) {
                pos = i;
                break;
            }
        }

        self.queue.insert(pos, id).map_err(|_| Error::QueueFull)?;
        self.slots[id.0].state = SlotState::Queued;

        if pos == 0 {
            self.rearm(timer);
        }
        Ok(())
    }

    /// Removes and frees every queued item of the given type.
    ///
    /// Afterwards, the timer is armed for the new head of the queue, or stopped if nothing is left
    /// to do.
    pub fn remove_all<T: Timer>(&mut self, sched_type: SchedType, timer: &mut T) {
        let mut i = 0;
        while i < self.queue.len() {
            let id = self.queue[i];
            if self.slots[id.0].item.sched_type == sched_type {
                self.queue.remove(i);
                self.slots[id.0].state = SlotState::Free;
            } else {
                i += 1;
            }
        }

        self.rearm(timer);
    }

    /// Removes every queued item and the fallback wakeup, and stops the timer.
    pub fn clear<T: Timer>(&mut self, timer: &mut T) {
        for slot in self.slots.iter_mut() {
            slot.state = SlotState::Free;
        }
        self.queue.clear();
        self.fallback = None;
        self.deadline = None;
        timer.stop();
    }

    /// Runs the handlers of all items whose wakeup time has passed, in queue order.
    ///
    /// This must be called when the timer fires. Afterwards, the timer is re-armed.
    pub fn run<T, F>(&mut self, timer: &mut T, mut handler: F)
    where
        T: Timer,
        F: FnMut(&mut SchedItem) -> SchedStatus,
    {
        while let Some(&id) = self.queue.first() {
            let item = &mut self.slots[id.0].item;
            if timer.now().is_before(item.next_wakeup) {
                break;
            }

            match handler(item) {
                SchedStatus::Done => {
                    self.queue.remove(0);
                    self.slots[id.0].state = SlotState::Free;
                }
                SchedStatus::Running => break,
            }
        }

        self.rearm(timer);
    }

    /// Requests an additional wakeup at `at`, independent of the queued items.
    pub fn set_fallback<T: Timer>(&mut self, at: Instant, timer: &mut T) {
        self.fallback = Some(match self.fallback {
            Some(prev) => prev.earliest(at),
            None => at,
        });
        self.rearm(timer);
    }

    /// Returns whether the fallback wakeup has been reached, and clears it if so.
    pub fn take_fallback(&mut self, now: Instant) -> bool {
        match self.fallback {
            Some(at) if !now.is_before(at) => {
                self.fallback = None;
                true
            }
            _ => false,
        }
    }

    /// Sets the wakeup for the earliest connection deadline, or clears it with `None`.
    pub fn set_deadline<T: Timer>(&mut self, at: Option<Instant>, timer: &mut T) {
        if self.deadline != at {
            self.deadline = at;
            self.rearm(timer);
        }
    }

    /// Returns whether the deadline wakeup has been reached, and clears it if so.
    pub fn take_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if !now.is_before(at) => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Returns the next time the scheduler needs to run.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let head = self
            .queue
            .first()
            .map(|id| self.slots[id.0].item.next_wakeup);
        [head, self.fallback, self.deadline]
            .iter()
            .flatten()
            .fold(None, |next: Option<Instant>, &at| {
                Some(next.map_or(at, |next| next.earliest(at)))
            })
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn rearm<T: Timer>(&self, timer: &mut T) {
        match self.next_wakeup() {
            Some(at) => timer.start(at),
            None => timer.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTimer;
    use crate::time::Duration;

    fn at(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    fn add(
        sched: &mut Scheduler<4>,
        timer: &mut MockTimer,
        ty: SchedType,
        start: u32,
        end: u32,
        arg: u32,
    ) -> Result<ItemId, Error> {
        let id = sched.get_item().unwrap();
        {
            let item = sched.item_mut(id);
            item.start = at(start);
            item.end = at(end);
            item.sched_type = ty;
            item.arg = arg;
        }
        match sched.add(id, timer) {
            Ok(()) => Ok(id),
            Err(e) => {
                sched.free_item(id);
                Err(e)
            }
        }
    }

    #[test]
    fn runs_in_start_order() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        add(&mut sched, &mut timer, SchedType::Adv, 3000, 4000, 3).unwrap();
        add(&mut sched, &mut timer, SchedType::Adv, 1000, 2000, 1).unwrap();
        add(&mut sched, &mut timer, SchedType::Scan, 2000, 3000, 2).unwrap();
        assert_eq!(timer.armed(), Some(at(1000)));

        timer.set(at(5000));
        let mut order = std::vec::Vec::new();
        sched.run(&mut timer, |item| {
            order.push(item.arg);
            SchedStatus::Done
        });
        assert_eq!(order, [1, 2, 3]);
        assert!(sched.is_empty());
        assert_eq!(timer.armed(), None);
    }

    #[test]
    fn overlap_leaves_queue_alone() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        add(&mut sched, &mut timer, SchedType::Adv, 1000, 2000, 1).unwrap();

        // Starts before, ends inside.
        assert_eq!(
            add(&mut sched, &mut timer, SchedType::Scan, 500, 1001, 2),
            Err(Error::Overlap)
        );
        // Starts inside.
        assert_eq!(
            add(&mut sched, &mut timer, SchedType::Scan, 1999, 2500, 2),
            Err(Error::Overlap)
        );
        // Same start.
        assert_eq!(
            add(&mut sched, &mut timer, SchedType::Scan, 1000, 1001, 2),
            Err(Error::Overlap)
        );
        assert_eq!(sched.len(), 1);
        assert_eq!(timer.armed(), Some(at(1000)));

        // Touching windows are fine.
        add(&mut sched, &mut timer, SchedType::Scan, 500, 1000, 2).unwrap();
        add(&mut sched, &mut timer, SchedType::Scan, 2000, 2500, 3).unwrap();
        assert_eq!(sched.len(), 3);
        assert_eq!(timer.armed(), Some(at(500)));
    }

    #[test]
    fn pool_exhaustion() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        for i in 0..4 {
            add(&mut sched, &mut timer, SchedType::Adv, i * 10, i * 10 + 10, i).unwrap();
        }
        assert!(sched.get_item().is_none());
        sched.remove_all(SchedType::Adv, &mut timer);
        assert!(sched.get_item().is_some());
    }

    #[test]
    fn running_item_stays_queued() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        add(&mut sched, &mut timer, SchedType::Adv, 1000, 2228, 0).unwrap();
        add(&mut sched, &mut timer, SchedType::Scan, 3000, 4000, 0).unwrap();

        timer.set(at(1000));
        let mut calls = 0;
        sched.run(&mut timer, |item| {
            calls += 1;
            item.next_wakeup = item.end;
            item.cb = SchedCb::AdvTxDone;
            SchedStatus::Running
        });
        assert_eq!(calls, 1);
        assert_eq!(sched.len(), 2);
        assert_eq!(timer.armed(), Some(at(2228)));

        timer.set(at(2228));
        sched.run(&mut timer, |item| {
            assert_eq!(item.cb, SchedCb::AdvTxDone);
            SchedStatus::Done
        });
        assert_eq!(sched.len(), 1);
        assert_eq!(timer.armed(), Some(at(3000)));
    }

    #[test]
    fn remove_all_rearms() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        add(&mut sched, &mut timer, SchedType::Adv, 1000, 2000, 0).unwrap();
        add(&mut sched, &mut timer, SchedType::Scan, 2000, 3000, 0).unwrap();
        add(&mut sched, &mut timer, SchedType::Adv, 3000, 4000, 0).unwrap();

        sched.remove_all(SchedType::Adv, &mut timer);
        assert_eq!(sched.len(), 1);
        assert_eq!(timer.armed(), Some(at(2000)));

        sched.remove_all(SchedType::Scan, &mut timer);
        assert!(sched.is_empty());
        assert_eq!(timer.armed(), None);
    }

    #[test]
    fn fallback_wakeup() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        add(&mut sched, &mut timer, SchedType::Scan, 50_000, 60_000, 0).unwrap();
        sched.set_fallback(at(0) + Duration::from_millis(10), &mut timer);
        assert_eq!(timer.armed(), Some(at(10_000)));

        assert!(!sched.take_fallback(at(9_999)));
        assert!(sched.take_fallback(at(10_000)));
        assert!(!sched.take_fallback(at(10_000)));
        assert_eq!(sched.next_wakeup(), Some(at(50_000)));
    }

    #[test]
    fn deadline_wakeup() {
        let mut timer = MockTimer::new();
        let mut sched = Scheduler::<4>::new();
        sched.set_deadline(Some(at(40_000_000)), &mut timer);
        assert_eq!(timer.armed(), Some(at(40_000_000)));

        add(&mut sched, &mut timer, SchedType::Adv, 1000, 2000, 0).unwrap();
        assert_eq!(timer.armed(), Some(at(1000)));
        timer.set(at(1000));
        sched.run(&mut timer, |_| SchedStatus::Done);
        assert_eq!(timer.armed(), Some(at(40_000_000)));

        assert!(!sched.take_deadline(at(39_999_999)));
        assert!(sched.take_deadline(at(40_000_000)));
        timer.set(at(40_000_000));
        sched.run(&mut timer, |_| SchedStatus::Done);
        assert_eq!(timer.armed(), None);
    }
}
