//! Handles into the core's arenas. Allocated from one counter and never
//! reused, so a handle kept past its entry's lifetime simply fails lookup.

use std::fmt;

macro_rules! handle {
    ($(#[$m:meta])* $name:ident, $prefix:literal) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// A connected communicator.
    CommunicatorId,
    "comm"
);
handle!(QueueId, "queue");
handle!(HopId, "hop");
handle!(PendingId, "pm");
handle!(
    /// One of our own addresses, registered by a communicator.
    AddressId,
    "addr"
);
handle!(MonitorId, "mon");
handle!(
    /// Correlates a request action with its later result.
    RequestId,
    "req"
);

/// Hands out never-repeating raw handle values.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}
