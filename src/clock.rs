// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Wall-clock abstraction.
//!
//! Components whose behavior depends on the calendar, such as the
//! weekly certificate quota in [`RateLimitedCache`](crate::cert::RateLimitedCache),
//! read the time through the [`Clock`] trait so that tests can control
//! it. [`SystemClock`] is the real clock; [`MockClock`] is available in
//! test builds and with the `test-helpers` feature.

use std::time::SystemTime;

/// A source of the current wall-clock time.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// The system's wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use super::Clock;

    /// A [`Clock`] that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one clone and
    /// hand another to the component under test.
    #[derive(Clone, Debug)]
    pub struct MockClock {
        now: Arc<Mutex<SystemTime>>,
    }

    impl MockClock {
        /// Creates a `MockClock` reading `start`.
        pub fn new(start: SystemTime) -> Self {
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        /// Moves the clock forward by `duration`.
        pub fn advance(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }

        /// Sets the clock to `time`.
        pub fn set(&self, time: SystemTime) {
            *self.now.lock().unwrap() = time;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> SystemTime {
            *self.now.lock().unwrap()
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
