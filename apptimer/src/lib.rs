#![cfg_attr(not(test), no_std)]

//! A hierarchical timer wheel, grounded on `components/apptimer/src/apptimer.c`.
//!
//! The original threads every timer into one of `NR_WHEELS * NR_SLOTS`
//! doubly linked list heads (or a `pending` list for already-expired
//! timers) using raw `struct llist *` pointers embedded in caller-owned
//! storage. Design Note 1 replaces that with [`common::arena_list`]: the
//! wheel owns a fixed arena of `CAP` timer slots and every list is a set of
//! arena indices. Each slot additionally records which list currently owns
//! it (`Owner`), which the original gets for free because `llist_del` only
//! needs the node's own `prev`/`next` — with separate `List` headers that
//! information has to be tracked explicitly to keep `stop` at O(1).
//!
//! `NR_WHEELS` and `NR_SLOTS` are const generics rather than the
//! preprocessor `#define`s the original uses; `NR_SLOTS` must be a power of
//! two, checked at compile time the same way `ringbuf` checks its capacity.

use common::arena_list::{HasLink, Link, List};
use common::timext::Deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppTimerError {
    AlreadyStarted,
    TimeLimitExceeded,
    /// The wheel's timer arena has no free slots left for `create_static`.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u32);

#[derive(Debug, Clone, Copy)]
enum Owner {
    Pending,
    Wheel(u16, u16),
}

#[derive(Clone, Copy)]
struct TimerSlot {
    link: Link,
    owner: Option<Owner>,
    interval: u32,
    goaltime: Deadline,
    repeat: bool,
    callback: Option<fn(usize)>,
    context: usize,
}

impl TimerSlot {
    const EMPTY: TimerSlot = TimerSlot {
        link: Link::UNLINKED,
        owner: None,
        interval: 0,
        goaltime: Deadline(0),
        repeat: false,
        callback: None,
        context: 0,
    };
}

impl HasLink for TimerSlot {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// A hierarchical timer wheel with `NR_WHEELS` levels of `NR_SLOTS` slots
/// each, backed by a fixed arena of `CAP` timers.
pub struct Wheel<const NR_WHEELS: usize, const NR_SLOTS: usize, const CAP: usize> {
    wheels: [[List; NR_SLOTS]; NR_WHEELS],
    pending: List,
    arena: [TimerSlot; CAP],
    created: u32,
    time_counter: u32,
    active_timers: i32,
    alarm: Option<fn(u32)>,
}

impl<const NR_WHEELS: usize, const NR_SLOTS: usize, const CAP: usize> Wheel<NR_WHEELS, NR_SLOTS, CAP> {
    const ASSERT_SLOTS_POWER_OF_TWO: () = assert!(NR_SLOTS > 0 && NR_SLOTS.is_power_of_two());

    pub const SLOTS_BITS: u32 = (NR_SLOTS as u32).trailing_zeros();
    const SLOTS_MASK: u32 = (NR_SLOTS as u32) - 1;
    pub const WHEELS_BITS: u32 = Self::SLOTS_BITS * (NR_WHEELS as u32);
    pub const MAX_TIMEOUT: u32 = (1u32 << Self::WHEELS_BITS) - 1;

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::ASSERT_SLOTS_POWER_OF_TWO;

        Self {
            wheels: [[List::new(); NR_SLOTS]; NR_WHEELS],
            pending: List::new(),
            arena: [TimerSlot::EMPTY; CAP],
            created: 0,
            time_counter: 0,
            active_timers: 0,
            alarm: None,
        }
    }

    /// Registers a hardware-alarm callback invoked with the wheel's
    /// estimate of how long it can sleep before the next timer may need
    /// servicing, mirroring `apptimer_init`'s `update_alarm` hook.
    pub fn with_alarm(mut self, alarm: fn(u32)) -> Self {
        self.alarm = Some(alarm);
        self
    }

    /// Reserves a slot in the arena for a new (not yet started) timer.
    pub fn create_static(&mut self, repeat: bool, callback: fn(usize), context: usize) -> Result<TimerHandle, AppTimerError> {
        if self.created as usize >= CAP {
            return Err(AppTimerError::Exhausted);
        }

        let idx = self.created;
        self.arena[idx as usize] = TimerSlot {
            repeat,
            callback: Some(callback),
            context,
            ..TimerSlot::EMPTY
        };
        self.created += 1;

        Ok(TimerHandle(idx))
    }

    pub fn start(&mut self, timer: TimerHandle, timeout: u32) -> Result<(), AppTimerError> {
        let idx = timer.0;

        if self.arena[idx as usize].link.is_linked() {
            return Err(AppTimerError::AlreadyStarted);
        }
        if timeout > Self::MAX_TIMEOUT {
            return Err(AppTimerError::TimeLimitExceeded);
        }

        self.arena[idx as usize].interval = timeout;
        self.arena[idx as usize].goaltime = Deadline::set(self.time_counter, timeout);

        self.insert_timer_into_wheel(idx);
        self.notify_alarm();

        Ok(())
    }

    /// Removes a timer from whichever list currently holds it. A no-op if
    /// the timer isn't running, same as the original (`remove_timer_from_list`
    /// checks `llist_empty` before doing anything).
    pub fn stop(&mut self, timer: TimerHandle) {
        self.remove_timer_from_list(timer.0);
    }

    /// The original distinguishes `delete` from `stop` to additionally free
    /// dynamically allocated timers (left as a `TODO` upstream). Every timer
    /// here lives in the wheel's own arena for its lifetime, so `delete` is
    /// just `stop`.
    pub fn delete(&mut self, timer: TimerHandle) {
        self.stop(timer);
    }

    pub fn count(&self) -> i32 {
        self.active_timers
    }

    /// Advances the wheel by `time_elapsed` ticks, firing any timer whose
    /// deadline falls within that span and re-arming repeating ones.
    pub fn schedule(&mut self, time_elapsed: u32) {
        let previous_time = self.time_counter;
        let current_time = previous_time.wrapping_add(time_elapsed);
        let diff_time = current_time ^ previous_time;

        let farthest_wheel = if diff_time == 0 {
            0
        } else {
            Self::wheel_index_from_timeout(diff_time)
        };
        let slot = if diff_time as u64 >= (1u64 << Self::WHEELS_BITS) {
            Self::SLOTS_MASK as usize
        } else {
            Self::slot_index_from_timeout(current_time, farthest_wheel)
        };

        self.time_counter = current_time;

        for wheel in 0..farthest_wheel {
            self.update_whole_slots(wheel);
        }
        self.update_slots(farthest_wheel, slot, time_elapsed as usize);

        self.run_pending_timers();
        self.notify_alarm();
    }

    fn notify_alarm(&self) {
        if let Some(alarm) = self.alarm {
            alarm(self.find_earliest_timer_wheel_timeout());
        }
    }

    fn find_earliest_timer_wheel_timeout(&self) -> u32 {
        if self.active_timers <= 0 {
            return 1u32 << Self::WHEELS_BITS;
        }

        for wheel in 0..NR_WHEELS {
            for slot in 0..NR_SLOTS {
                if !self.wheels[wheel][slot].is_empty() {
                    return 1u32 << (wheel as u32 * Self::SLOTS_BITS);
                }
            }
        }

        1u32 << Self::WHEELS_BITS
    }

    fn wheel_index_from_timeout(timeout: u32) -> usize {
        if timeout == 0 {
            return 0;
        }
        let fls_minus_one = 31 - timeout.leading_zeros();
        core::cmp::min(Self::WHEELS_BITS - 1, fls_minus_one) as usize / Self::SLOTS_BITS as usize
    }

    fn slot_index_from_timeout(timeout: u32, wheel: usize) -> usize {
        ((timeout >> (Self::SLOTS_BITS as usize * wheel)) & Self::SLOTS_MASK) as usize
    }

    fn is_timer_expired(&self, idx: u32) -> bool {
        self.arena[idx as usize].goaltime.is_expired(self.time_counter)
    }

    fn insert_timer_into_pending(&mut self, idx: u32) {
        self.pending.push_back(&mut self.arena, idx);
        self.arena[idx as usize].owner = Some(Owner::Pending);
    }

    fn insert_timer_into_wheel(&mut self, idx: u32) {
        self.active_timers += 1;

        if self.is_timer_expired(idx) {
            self.insert_timer_into_pending(idx);
            return;
        }

        let current_time = self.time_counter;
        let goal = self.arena[idx as usize].goaltime.0;
        let delta = goal.wrapping_sub(current_time);
        let split = current_time & Self::SLOTS_MASK;
        let probe = delta.wrapping_add(split);

        let wheel = Self::wheel_index_from_timeout(probe);
        let slot = Self::slot_index_from_timeout(probe, wheel);

        self.wheels[wheel][slot].push_back(&mut self.arena, idx);
        self.arena[idx as usize].owner = Some(Owner::Wheel(wheel as u16, slot as u16));
    }

    fn remove_timer_from_list(&mut self, idx: u32) {
        if !self.arena[idx as usize].link.is_linked() {
            return;
        }

        match self.arena[idx as usize].owner {
            Some(Owner::Pending) => self.pending.unlink(&mut self.arena, idx),
            Some(Owner::Wheel(wheel, slot)) => {
                self.wheels[wheel as usize][slot as usize].unlink(&mut self.arena, idx)
            }
            None => return,
        }

        self.arena[idx as usize].owner = None;
        self.active_timers -= 1;
    }

    fn update_slots(&mut self, wheel: usize, slot: usize, n: usize) {
        let visits = core::cmp::min(n, slot + 1);
        let mut tmp = List::new();

        for step in 0..visits {
            let slot_idx = slot - step;
            self.wheels[wheel][slot_idx].drain_into(&mut self.arena, &mut tmp);
        }

        while let Some(idx) = tmp.pop_front(&mut self.arena) {
            self.arena[idx as usize].owner = None;
            self.active_timers -= 1;
            self.insert_timer_into_wheel(idx);
        }
    }

    fn update_whole_slots(&mut self, wheel: usize) {
        self.update_slots(wheel, NR_SLOTS - 1, NR_SLOTS);
    }

    fn run_pending_timers(&mut self) {
        while let Some(idx) = self.pending.pop_front(&mut self.arena) {
            self.arena[idx as usize].owner = None;
            self.active_timers -= 1;

            let (callback, context, repeat) = {
                let slot = &self.arena[idx as usize];
                (slot.callback, slot.context, slot.repeat)
            };

            if let Some(callback) = callback {
                callback(context);
            }

            if repeat {
                let interval = self.arena[idx as usize].interval;
                self.arena[idx as usize].goaltime = Deadline::set(self.time_counter, interval);
                self.insert_timer_into_wheel(idx);
            }
        }
    }
}

impl<const NR_WHEELS: usize, const NR_SLOTS: usize, const CAP: usize> Default
    for Wheel<NR_WHEELS, NR_SLOTS, CAP>
{
    fn default() -> Self {
        Self::new()
    }
}
