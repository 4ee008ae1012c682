//! Fiber identity.
//!
//! A `FiberId` names the fiber (or set of fibers) responsible for something,
//! most importantly the interruptors recorded in a [`Cause`](crate::Cause).
//!
//! - `None` - no identity; the identity element for [`FiberId::combine`]
//! - `Runtime` - one concrete fiber
//! - `Composite` - a flattened union of concrete fibers

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one concrete fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeFiberId {
    id: u64,
    start_time_millis: u64,
}

impl RuntimeFiberId {
    /// Create an identity from its raw parts.
    pub const fn new(id: u64, start_time_millis: u64) -> Self {
        Self {
            id,
            start_time_millis,
        }
    }

    /// Allocate a fresh, process-unique identity.
    pub fn next(start_time_millis: u64) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self::new(COUNTER.fetch_add(1, Ordering::Relaxed), start_time_millis)
    }

    /// Get the sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the time the fiber was started, in clock milliseconds.
    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }
}

impl fmt::Display for RuntimeFiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Identity of a logical fiber.
///
/// Equality and hashing treat `Composite` as a set. Composites are always
/// flat and hold at least two members; [`FiberId::combine`] collapses
/// smaller unions to `None` or `Runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum FiberId {
    /// No identity.
    #[default]
    None,
    /// A single fiber.
    Runtime(RuntimeFiberId),
    /// Several fibers acting jointly.
    Composite(BTreeSet<RuntimeFiberId>),
}

impl FiberId {
    /// Allocate a fresh runtime identity.
    pub fn next(start_time_millis: u64) -> Self {
        FiberId::Runtime(RuntimeFiberId::next(start_time_millis))
    }

    /// Union of two identities. `None` is the identity element.
    pub fn combine(&self, other: &FiberId) -> FiberId {
        match (self, other) {
            (FiberId::None, id) | (id, FiberId::None) => id.clone(),
            _ => {
                let mut members = self.members();
                members.extend(other.members());
                Self::from_members(members)
            }
        }
    }

    /// Union of any number of identities.
    pub fn combine_all<'a, I>(ids: I) -> FiberId
    where
        I: IntoIterator<Item = &'a FiberId>,
    {
        let mut members = BTreeSet::new();
        for id in ids {
            members.extend(id.members());
        }
        Self::from_members(members)
    }

    fn from_members(mut members: BTreeSet<RuntimeFiberId>) -> FiberId {
        match members.len() {
            0 => FiberId::None,
            1 => match members.pop_first() {
                Some(id) => FiberId::Runtime(id),
                None => FiberId::None,
            },
            _ => FiberId::Composite(members),
        }
    }

    /// The concrete fibers named by this identity.
    pub fn members(&self) -> BTreeSet<RuntimeFiberId> {
        match self {
            FiberId::None => BTreeSet::new(),
            FiberId::Runtime(id) => BTreeSet::from([*id]),
            FiberId::Composite(ids) => ids.clone(),
        }
    }

    /// Sequence numbers of the named fibers.
    pub fn ids(&self) -> BTreeSet<u64> {
        self.members().iter().map(RuntimeFiberId::id).collect()
    }

    /// Check whether this is the `None` identity.
    pub fn is_none(&self) -> bool {
        matches!(self, FiberId::None)
    }
}

impl From<RuntimeFiberId> for FiberId {
    fn from(id: RuntimeFiberId) -> Self {
        FiberId::Runtime(id)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberId::None => write!(f, "<none>"),
            FiberId::Runtime(id) => write!(f, "{}", id),
            FiberId::Composite(ids) => {
                let mut first = true;
                for id in ids {
                    if !first {
                        write!(f, "+")?;
                    }
                    first = false;
                    write!(f, "{}", id)?;
                }
                Ok(())
            }
        }
    }
}
