// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution contexts.
//!
//! This module defines "context" traits, which allow the conflict-detection
//! engine to be written agnostic to its execution environment. The engine
//! operates in terms of events: when a timer fires or the raw socket becomes
//! readable, the platform calls into the engine, and the engine may in turn
//! need to install a new timer, draw a random delay, or notify its client.
//! Each of those capabilities is expressed as a trait here, so that a test
//! fake and any number of real event loops appear as indistinguishable,
//! opaque implementations.

use core::time::Duration;

use rand::{CryptoRng, RngCore};

use crate::time::Instant;

/// Trait defining the `Instant` type provided by an [`InstantContext`]
/// implementation.
///
/// It is a separate trait from `InstantContext` so the type stands by itself
/// to be stored at rest in core structures.
pub trait InstantBindingsTypes {
    /// The type of an instant in time.
    ///
    /// All time is measured using `Instant`s, including scheduling timers
    /// through [`TimerContext`]. This type may represent some sort of
    /// real-world time (e.g., [`std::time::Instant`]), or may be faked in
    /// testing using a fake clock.
    type Instant: Instant + 'static;
}

/// A context that provides access to a monotonic clock.
pub trait InstantContext: InstantBindingsTypes {
    /// Returns the current instant.
    ///
    /// `now` guarantees that two subsequent calls to `now` will return
    /// monotonically non-decreasing values.
    fn now(&self) -> Self::Instant;
}

/// A context that supports scheduling timers.
///
/// At most one timer exists per ID: scheduling under an ID that already has a
/// pending timer replaces the pending one.
pub trait TimerContext<Id>: InstantContext {
    /// Schedule a timer to fire after some duration.
    ///
    /// `schedule_timer` schedules the given timer to be fired after `duration`
    /// has elapsed, overwriting any previous timer with the same ID.
    ///
    /// If there was previously a timer with that ID, return the time at which
    /// it was scheduled to fire.
    ///
    /// # Panics
    ///
    /// `schedule_timer` may panic if `duration` is large enough that
    /// `self.now() + duration` overflows.
    fn schedule_timer(&mut self, duration: Duration, id: Id) -> Option<Self::Instant> {
        self.schedule_timer_instant(self.now().checked_add(duration).unwrap(), id)
    }

    /// Schedule a timer to fire at some point in the future.
    ///
    /// `schedule_timer_instant` schedules the given timer to be fired at
    /// `time`, overwriting any previous timer with the same ID.
    ///
    /// If there was previously a timer with that ID, return the time at which
    /// it was scheduled to fire.
    fn schedule_timer_instant(&mut self, time: Self::Instant, id: Id) -> Option<Self::Instant>;

    /// Cancel a timer.
    ///
    /// If a timer with the given ID exists, it is canceled and the instant at
    /// which it was scheduled to fire is returned.
    fn cancel_timer(&mut self, id: Id) -> Option<Self::Instant>;

    /// Get the instant a timer will fire, if one is scheduled.
    fn scheduled_instant(&self, id: Id) -> Option<Self::Instant>;
}

/// A handler for timer firing events.
///
/// A `TimerHandler` is a type capable of handling the event of a timer
/// firing.
pub trait TimerHandler<BC, Id> {
    /// Handle a timer firing.
    fn handle_timer(&mut self, bindings_ctx: &mut BC, id: Id);
}

// Code in this crate is required to only obtain random values through an
// `RngContext`. This allows a deterministic RNG to be provided when useful
// (for example, in tests).

/// A context that provides a random number generator (RNG).
pub trait RngContext {
    /// The random number generator (RNG) provided by this `RngContext`.
    ///
    /// The provided RNG must be cryptographically secure, and users may rely
    /// on that property for their correctness and security.
    type Rng<'a>: RngCore + CryptoRng
    where
        Self: 'a;

    /// Gets the random number generator (RNG).
    fn rng(&mut self) -> Self::Rng<'_>;
}

/// A context for emitting events.
///
/// `EventContext` encodes the common pattern for emitting atomic events of
/// type `T` from core. An implementation of `EventContext` must guarantee
/// that events are processed in the order they are emitted.
pub trait EventContext<T> {
    /// Handles `event`.
    fn on_event(&mut self, event: T);
}

/// Fake implementations of the context traits.
///
/// Fakes are built to be composable: a test's bindings context embeds the
/// pieces it needs (a [`FakeTimerCtx`], a [`FakeCryptoRng`], an event log)
/// and delegates the trait methods to them.
#[cfg(any(test, feature = "testutils"))]
pub mod testutil {
    use core::fmt::{self, Debug, Formatter};
    use core::hash::Hash;
    use core::ops::{self, RangeBounds};
    use std::collections::{BinaryHeap, HashMap};

    use rand::{CryptoRng, RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;

    use super::*;

    /// A fake implementation of `Instant` for use in testing.
    #[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub struct FakeInstant {
        // A FakeInstant is just an offset from some arbitrary epoch.
        offset: Duration,
    }

    impl From<Duration> for FakeInstant {
        fn from(offset: Duration) -> FakeInstant {
            FakeInstant { offset }
        }
    }

    impl Instant for FakeInstant {
        fn duration_since(&self, earlier: FakeInstant) -> Duration {
            self.offset.checked_sub(earlier.offset).unwrap()
        }

        fn checked_add(&self, duration: Duration) -> Option<FakeInstant> {
            self.offset.checked_add(duration).map(|offset| FakeInstant { offset })
        }
    }

    impl ops::Add<Duration> for FakeInstant {
        type Output = FakeInstant;

        fn add(self, dur: Duration) -> FakeInstant {
            FakeInstant { offset: self.offset + dur }
        }
    }

    impl ops::Sub<FakeInstant> for FakeInstant {
        type Output = Duration;

        fn sub(self, other: FakeInstant) -> Duration {
            self.offset - other.offset
        }
    }

    impl Debug for FakeInstant {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.offset)
        }
    }

    /// A fake [`InstantContext`] which stores the current time as a
    /// [`FakeInstant`].
    #[derive(Default)]
    pub struct FakeInstantCtx {
        time: FakeInstant,
    }

    impl FakeInstantCtx {
        /// Advance the current time by the given duration.
        pub fn sleep(&mut self, dur: Duration) {
            self.time.offset += dur;
        }
    }

    impl InstantBindingsTypes for FakeInstantCtx {
        type Instant = FakeInstant;
    }

    impl InstantContext for FakeInstantCtx {
        fn now(&self) -> FakeInstant {
            self.time
        }
    }

    /// Arbitrary data of type `D` attached to a `FakeInstant`.
    ///
    /// `InstantAndData` implements `Ord` and `Eq` to be used in a
    /// `BinaryHeap` and ordered by `FakeInstant`.
    #[derive(Clone, Debug)]
    struct InstantAndData<D>(FakeInstant, D);

    impl<D> Eq for InstantAndData<D> {}

    impl<D> PartialEq for InstantAndData<D> {
        fn eq(&self, other: &Self) -> bool {
            self.0 == other.0
        }
    }

    impl<D> Ord for InstantAndData<D> {
        fn cmp(&self, other: &Self) -> core::cmp::Ordering {
            other.0.cmp(&self.0)
        }
    }

    impl<D> PartialOrd for InstantAndData<D> {
        fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    /// A fake [`TimerContext`] which stores time as a [`FakeInstantCtx`].
    pub struct FakeTimerCtx<Id> {
        instant: FakeInstantCtx,
        timers: BinaryHeap<InstantAndData<Id>>,
    }

    impl<Id> Default for FakeTimerCtx<Id> {
        fn default() -> FakeTimerCtx<Id> {
            FakeTimerCtx { instant: FakeInstantCtx::default(), timers: BinaryHeap::default() }
        }
    }

    impl<Id> FakeTimerCtx<Id> {
        /// Advance the fake clock by `dur` without firing any timers.
        pub fn sleep(&mut self, dur: Duration) {
            self.instant.sleep(dur);
        }

        /// Pops the earliest pending timer, if any, advancing the fake clock
        /// to its deadline.
        ///
        /// The caller is responsible for dispatching the returned ID into the
        /// timer handler under test.
        pub fn pop_next_timer(&mut self) -> Option<Id> {
            self.timers.pop().map(|InstantAndData(instant, id)| {
                self.instant.time = instant;
                id
            })
        }
    }

    /// A range of [`FakeInstant`]s, either a single exact instant or any
    /// [`RangeBounds<FakeInstant>`].
    pub trait FakeInstantRange: Debug {
        /// Returns whether `i` falls in this range.
        fn contains(&self, i: FakeInstant) -> bool;
    }

    impl FakeInstantRange for FakeInstant {
        fn contains(&self, i: FakeInstant) -> bool {
            self == &i
        }
    }

    impl<B: RangeBounds<FakeInstant> + Debug> FakeInstantRange for B {
        fn contains(&self, i: FakeInstant) -> bool {
            RangeBounds::contains(self, &i)
        }
    }

    impl<Id: Debug + Clone + Hash + Eq> FakeTimerCtx<Id> {
        /// Asserts that `self` contains exactly the timers in `timers`.
        ///
        /// Each timer must be present, and its deadline must fall into the
        /// specified range. Ranges may be specified either as a specific
        /// [`FakeInstant`] or as any [`RangeBounds<FakeInstant>`].
        ///
        /// # Panics
        ///
        /// Panics if `timers` contains the same ID more than once or if
        /// `self` does not contain exactly the timers in `timers`.
        #[track_caller]
        pub fn assert_timers_installed<R: FakeInstantRange, I: IntoIterator<Item = (Id, R)>>(
            &self,
            timers: I,
        ) {
            let mut timers = timers.into_iter().fold(HashMap::new(), |mut timers, (id, range)| {
                assert!(timers.insert(id, range).is_none());
                timers
            });

            enum Error<Id, R: FakeInstantRange> {
                ExpectedButMissing { id: Id, range: R },
                UnexpectedButPresent { id: Id, instant: FakeInstant },
                UnexpectedInstant { id: Id, range: R, instant: FakeInstant },
            }

            let mut errors = Vec::new();

            // Make sure that all installed timers were expected (present in
            // `timers`).
            for InstantAndData(instant, id) in self.timers.iter().cloned() {
                match timers.remove(&id) {
                    None => errors.push(Error::UnexpectedButPresent { id, instant }),
                    Some(range) => {
                        if !range.contains(instant) {
                            errors.push(Error::UnexpectedInstant { id, range, instant })
                        }
                    }
                }
            }

            // Make sure that all expected timers were already found in
            // `self.timers` (and removed from `timers`).
            errors
                .extend(timers.drain().map(|(id, range)| Error::ExpectedButMissing { id, range }));

            if !errors.is_empty() {
                let mut s = String::from("Unexpected timer contents:");
                for err in errors {
                    s += &match err {
                        Error::ExpectedButMissing { id, range } => {
                            format!("\n\tMissing timer {:?} with deadline {:?}", id, range)
                        }
                        Error::UnexpectedButPresent { id, instant } => {
                            format!("\n\tUnexpected timer {:?} with deadline {:?}", id, instant)
                        }
                        Error::UnexpectedInstant { id, range, instant } => format!(
                            "\n\tTimer {:?} has unexpected deadline {:?} (wanted {:?})",
                            id, instant, range
                        ),
                    };
                }
                panic!("{}", s);
            }
        }

        /// Asserts that no timers are installed.
        ///
        /// # Panics
        ///
        /// Panics if any timers are installed.
        #[track_caller]
        pub fn assert_no_timers_installed(&self) {
            self.assert_timers_installed::<FakeInstant, _>([]);
        }
    }

    impl<Id: PartialEq> FakeTimerCtx<Id> {
        // Just like `TimerContext::cancel_timer`, but takes a reference to
        // `Id` rather than a value. This allows us to implement
        // `schedule_timer_instant`, which needs to retain ownership of the
        // `Id`.
        fn cancel_timer_inner(&mut self, id: &Id) -> Option<FakeInstant> {
            let mut r: Option<FakeInstant> = None;
            self.timers = self
                .timers
                .drain()
                .filter(|t| {
                    if &t.1 == id {
                        r = Some(t.0);
                        false
                    } else {
                        true
                    }
                })
                .collect::<Vec<_>>()
                .into();
            r
        }
    }

    impl<Id> InstantBindingsTypes for FakeTimerCtx<Id> {
        type Instant = FakeInstant;
    }

    impl<Id> InstantContext for FakeTimerCtx<Id> {
        fn now(&self) -> FakeInstant {
            self.instant.now()
        }
    }

    impl<Id: PartialEq> TimerContext<Id> for FakeTimerCtx<Id> {
        fn schedule_timer_instant(&mut self, time: FakeInstant, id: Id) -> Option<FakeInstant> {
            let ret = self.cancel_timer_inner(&id);
            self.timers.push(InstantAndData(time, id));
            ret
        }

        fn cancel_timer(&mut self, id: Id) -> Option<FakeInstant> {
            self.cancel_timer_inner(&id)
        }

        fn scheduled_instant(&self, id: Id) -> Option<FakeInstant> {
            self.timers.iter().find_map(|x| if x.1 == id { Some(x.0) } else { None })
        }
    }

    /// A fake RNG for use in testing.
    ///
    /// Wraps a deterministic [`XorShiftRng`] while claiming to satisfy the
    /// CSPRNG contract real contexts must provide.
    pub struct FakeCryptoRng(XorShiftRng);

    impl Default for FakeCryptoRng {
        fn default() -> FakeCryptoRng {
            FakeCryptoRng::new_xorshift(12957992561116578403)
        }
    }

    impl FakeCryptoRng {
        /// Creates a new [`FakeCryptoRng`] from a seed.
        pub fn new_xorshift(mut seed: u128) -> FakeCryptoRng {
            if seed == 0 {
                // XorShiftRng can't take 0 seeds.
                seed = 1;
            }
            FakeCryptoRng(XorShiftRng::from_seed(seed.to_ne_bytes()))
        }
    }

    impl RngCore for FakeCryptoRng {
        fn next_u32(&mut self) -> u32 {
            self.0.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.0.next_u64()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.0.fill_bytes(dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.0.try_fill_bytes(dest)
        }
    }

    impl CryptoRng for FakeCryptoRng {}

}
