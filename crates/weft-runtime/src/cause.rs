//! The `Cause` algebra.
//!
//! A [`Cause`] is an immutable tree describing why a computation did not
//! succeed. Leaves are typed failures (`Fail`), defects (`Die`) and
//! interruptions (`Interrupt`); inner nodes record whether the leaves
//! happened one after another (`Then`) or concurrently (`Both`).
//!
//! Composition never drops information. `Empty` is a two-sided identity for
//! both `Then` and `Both`, and equality is defined on the flattened shape of
//! the tree, so `then`/`both` are associative under `==` even though the
//! boxed representation differs.
//!
//! Traversals that may meet long `Then` chains (`find`, `flat_map`, the
//! leaf iterator, equality) use explicit work-lists instead of recursion.

use std::any::Any;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::fiber_id::FiberId;

/// An unexpected failure: a bug, a panic, or a typed error that was turned
/// into a defect with `or_die`.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Defect {
    /// Create a defect carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            payload: None,
        }
    }

    /// Create a defect carrying a message and an arbitrary payload.
    pub fn with_payload<T>(message: impl Into<String>, payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            message: Arc::from(message.into()),
            payload: Some(Arc::new(payload)),
        }
    }

    /// Convert a typed error into a defect, keeping the error as payload.
    pub fn from_error<E>(error: E) -> Self
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        Self::with_payload(format!("{:?}", error), error)
    }

    /// Convert a caught panic into a defect.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(message)
    }

    /// Get the defect message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the payload if it has type `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl Eq for Defect {}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.message()).finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Why a computation did not succeed.
#[derive(Debug, Clone)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Cooperative cancellation by the given fiber(s).
    Interrupt(FiberId),
    /// `left` happened before `right`.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// `left` and `right` happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// Marks a cause whose trace should not be rendered. Transparent to
    /// every query.
    Stackless(Box<Cause<E>>, bool),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

/// A leaf borrowed out of a cause, used for canonical comparison.
#[derive(PartialEq)]
enum Leaf<'a, E> {
    Fail(&'a E),
    Die(&'a Defect),
    Interrupt(&'a FiberId),
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// An interruption by `fiber_id`.
    pub fn interrupt(fiber_id: FiberId) -> Self {
        Cause::Interrupt(fiber_id)
    }

    /// Sequential composition: `self` happened before `right`.
    pub fn then(self, right: Cause<E>) -> Cause<E> {
        match (self, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition: `self` and `right` happened concurrently.
    pub fn both(self, right: Cause<E>) -> Cause<E> {
        match (self, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    /// Mark this cause as stackless.
    pub fn stackless(self) -> Cause<E> {
        Cause::Stackless(Box::new(self), true)
    }

    /// Iterate over the `Fail`, `Die` and `Interrupt` leaves, left to right.
    pub fn leaves(&self) -> Leaves<'_, E> {
        Leaves { stack: vec![self] }
    }

    /// Check whether the cause contains no failure at all.
    pub fn is_empty(&self) -> bool {
        self.leaves().next().is_none()
    }

    /// Check whether the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Fail(_)))
    }

    /// Check whether the cause contains a defect.
    pub fn is_die(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Die(_)))
    }

    /// Check whether the cause contains an interruption anywhere.
    pub fn contains_interrupt(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Interrupt(_)))
    }

    /// Check whether the cause is pure interruption: every leaf is an
    /// `Interrupt`. Vacuously true for an empty cause.
    pub fn is_interrupted(&self) -> bool {
        self.leaves().all(|c| matches!(c, Cause::Interrupt(_)))
    }

    /// Same as [`Cause::is_interrupted`].
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted()
    }

    /// Number of leaves.
    pub fn size(&self) -> usize {
        self.leaves().count()
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// The first typed failure, if any.
    pub fn failure_option(&self) -> Option<&E> {
        self.leaves().find_map(|c| match c {
            Cause::Fail(e) => Some(e),
            _ => None,
        })
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Die(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Every fiber recorded as an interruptor.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Interrupt(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Depth-first, left-first search over every node of the tree.
    ///
    /// Returns the first `Some` produced by `f`.
    pub fn find<Z, F>(&self, mut f: F) -> Option<Z>
    where
        F: FnMut(&Cause<E>) -> Option<Z>,
    {
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            if let Some(found) = f(cause) {
                return Some(found);
            }
            match cause {
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
                Cause::Stackless(inner, _) => stack.push(inner),
                _ => {}
            }
        }
        None
    }

    /// Check whether any node satisfies `predicate`.
    pub fn exists<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Cause<E>) -> bool,
    {
        self.find(|c| predicate(c).then_some(())).is_some()
    }

    /// Replace every `Fail` leaf with `f(error)`, keeping the tree shape
    /// around defects, interruptions and structural nodes.
    pub fn flat_map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> Cause<E2>,
    {
        self.rebuild(&mut f, &mut Cause::Die, &mut Cause::Interrupt)
    }

    /// Transform every typed failure.
    pub fn map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        self.flat_map(|e| Cause::Fail(f(e)))
    }

    /// Remove every typed failure, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        self.flat_map(|_| Cause::Empty)
    }

    /// Keep only the defects. Returns `None` when there are none.
    pub fn keep_defects<E2>(self) -> Option<Cause<E2>> {
        let kept = self.rebuild(
            &mut |_| Cause::Empty,
            &mut Cause::Die,
            &mut |_| Cause::Empty,
        );
        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }

    /// Rebuild the tree, mapping each leaf. Empty results are simplified
    /// away by `then`/`both`.
    fn rebuild<E2>(
        self,
        on_fail: &mut dyn FnMut(E) -> Cause<E2>,
        on_die: &mut dyn FnMut(Defect) -> Cause<E2>,
        on_interrupt: &mut dyn FnMut(FiberId) -> Cause<E2>,
    ) -> Cause<E2> {
        enum Task<E> {
            Visit(Cause<E>),
            Then,
            Both,
            Stackless(bool),
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut built: Vec<Cause<E2>> = Vec::new();

        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(cause) => match cause {
                    Cause::Empty => built.push(Cause::Empty),
                    Cause::Fail(e) => built.push(on_fail(e)),
                    Cause::Die(d) => built.push(on_die(d)),
                    Cause::Interrupt(id) => built.push(on_interrupt(id)),
                    Cause::Then(left, right) => {
                        tasks.push(Task::Then);
                        tasks.push(Task::Visit(*right));
                        tasks.push(Task::Visit(*left));
                    }
                    Cause::Both(left, right) => {
                        tasks.push(Task::Both);
                        tasks.push(Task::Visit(*right));
                        tasks.push(Task::Visit(*left));
                    }
                    Cause::Stackless(inner, flag) => {
                        tasks.push(Task::Stackless(flag));
                        tasks.push(Task::Visit(*inner));
                    }
                },
                Task::Then => {
                    let right = built.pop().unwrap_or_default();
                    let left = built.pop().unwrap_or_default();
                    built.push(left.then(right));
                }
                Task::Both => {
                    let right = built.pop().unwrap_or_default();
                    let left = built.pop().unwrap_or_default();
                    built.push(left.both(right));
                }
                Task::Stackless(flag) => {
                    let inner = built.pop().unwrap_or_default();
                    built.push(match inner {
                        Cause::Empty => Cause::Empty,
                        inner => Cause::Stackless(Box::new(inner), flag),
                    });
                }
            }
        }

        built.pop().unwrap_or_default()
    }

    /// Canonical shape: a sequence of steps, each step the set of leaves
    /// that happened concurrently.
    fn steps(&self) -> Vec<Vec<Leaf<'_, E>>> {
        enum Task<'a, E> {
            Visit(&'a Cause<E>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut results: Vec<Vec<Vec<Leaf<'_, E>>>> = Vec::new();

        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(cause) => match cause {
                    Cause::Empty => results.push(Vec::new()),
                    Cause::Fail(e) => results.push(vec![vec![Leaf::Fail(e)]]),
                    Cause::Die(d) => results.push(vec![vec![Leaf::Die(d)]]),
                    Cause::Interrupt(id) => results.push(vec![vec![Leaf::Interrupt(id)]]),
                    Cause::Then(left, right) => {
                        tasks.push(Task::Then);
                        tasks.push(Task::Visit(right));
                        tasks.push(Task::Visit(left));
                    }
                    Cause::Both(left, right) => {
                        tasks.push(Task::Both);
                        tasks.push(Task::Visit(right));
                        tasks.push(Task::Visit(left));
                    }
                    Cause::Stackless(inner, _) => tasks.push(Task::Visit(inner)),
                },
                Task::Then => {
                    let right = results.pop().unwrap_or_default();
                    let mut left = results.pop().unwrap_or_default();
                    left.extend(right);
                    results.push(left);
                }
                Task::Both => {
                    let right = results.pop().unwrap_or_default();
                    let mut left = results.pop().unwrap_or_default();
                    for (i, step) in right.into_iter().enumerate() {
                        match left.get_mut(i) {
                            Some(existing) => existing.extend(step),
                            None => left.push(step),
                        }
                    }
                    results.push(left);
                }
            }
        }

        results.pop().unwrap_or_default()
    }

    /// Render the whole tree, including concurrent branches.
    pub fn pretty(&self) -> String
    where
        E: fmt::Debug,
    {
        let mut out = String::new();
        render(self, 0, &mut out);
        out
    }
}

impl<E: Clone> Cause<E> {
    /// The first typed failure, or the whole cause when there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self.failure_option() {
            Some(e) => Ok(e.clone()),
            None => Err(self),
        }
    }
}

impl Cause<Infallible> {
    /// A cause without typed failures fits any error type.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let left = self.steps();
        let right = other.steps();
        left.len() == right.len()
            && left
                .iter()
                .zip(right.iter())
                .all(|(a, b)| a.iter().all(|l| b.contains(l)) && b.iter().all(|l| a.contains(l)))
    }
}

impl<E: Eq> Eq for Cause<E> {}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty().trim_end())
    }
}

/// Iterator over the leaves of a cause.
pub struct Leaves<'a, E> {
    stack: Vec<&'a Cause<E>>,
}

impl<'a, E> Iterator for Leaves<'a, E> {
    type Item = &'a Cause<E>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(cause) = self.stack.pop() {
            match cause {
                Cause::Empty => continue,
                Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => return Some(cause),
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    self.stack.push(right);
                    self.stack.push(left);
                }
                Cause::Stackless(inner, _) => self.stack.push(inner),
            }
        }
        None
    }
}

fn render<E: fmt::Debug>(cause: &Cause<E>, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    match cause {
        Cause::Empty => out.push_str(&format!("{}Empty\n", indent)),
        Cause::Fail(e) => out.push_str(&format!("{}Fail({:?})\n", indent, e)),
        Cause::Die(d) => out.push_str(&format!("{}Die({})\n", indent, d.message())),
        Cause::Interrupt(id) => out.push_str(&format!("{}Interrupt({})\n", indent, id)),
        Cause::Stackless(inner, _) => render(inner, depth, out),
        Cause::Then(..) => {
            out.push_str(&format!("{}Then\n", indent));
            for operand in chain(cause, |c| matches!(c, Cause::Then(..))) {
                render(operand, depth + 1, out);
            }
        }
        Cause::Both(..) => {
            out.push_str(&format!("{}Both\n", indent));
            for operand in chain(cause, |c| matches!(c, Cause::Both(..))) {
                render(operand, depth + 1, out);
            }
        }
    }
}

/// Operands of a run of same-kind nodes, in order.
fn chain<E>(cause: &Cause<E>, same: fn(&Cause<E>) -> bool) -> Vec<&Cause<E>> {
    let mut operands = Vec::new();
    let mut stack = vec![cause];
    while let Some(node) = stack.pop() {
        match node {
            Cause::Then(left, right) | Cause::Both(left, right) if same(node) => {
                stack.push(right);
                stack.push(left);
            }
            other => operands.push(other),
        }
    }
    operands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_id::RuntimeFiberId;
    use pretty_assertions::assert_eq;

    fn fiber(id: u64) -> FiberId {
        FiberId::Runtime(RuntimeFiberId::new(id, 0))
    }

    #[test]
    fn test_empty_is_identity() {
        let a = Cause::fail("a");
        assert_eq!(Cause::empty().then(a.clone()), a);
        assert_eq!(a.clone().then(Cause::empty()), a);
        assert_eq!(Cause::empty().both(a.clone()), a);
        assert_eq!(a.clone().both(Cause::empty()), a);
    }

    #[test]
    fn test_then_is_associative() {
        let (a, b, c) = (Cause::fail(1), Cause::die(Defect::new("b")), Cause::fail(3));
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_then_order_matters() {
        let ab = Cause::fail(1).then(Cause::fail(2));
        let ba = Cause::fail(2).then(Cause::fail(1));
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_both_is_symmetric() {
        let ab = Cause::fail(1).both(Cause::interrupt(fiber(1)));
        let ba = Cause::interrupt(fiber(1)).both(Cause::fail(1));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_stackless_is_transparent() {
        let a = Cause::fail(1).then(Cause::fail(2));
        assert_eq!(a.clone().stackless(), a);
        assert_eq!(a.clone().stackless().failures(), vec![&1, &2]);
    }

    #[test]
    fn test_is_interrupted_requires_only_interrupts() {
        assert!(Cause::<i32>::empty().is_interrupted());
        assert!(!Cause::<i32>::empty().contains_interrupt());
        assert!(Cause::<i32>::interrupt(fiber(1)).is_interrupted());
        let both = Cause::<i32>::interrupt(fiber(1)).both(Cause::interrupt(fiber(2)));
        assert!(both.is_interrupted());
        let mixed = Cause::interrupt(fiber(1)).then(Cause::fail(1));
        assert!(!mixed.is_interrupted());
        assert!(mixed.contains_interrupt());
        assert!(mixed.is_failure());
        assert!(!mixed.is_die());
    }

    #[test]
    fn test_interruptors() {
        let cause = Cause::<i32>::interrupt(fiber(1))
            .then(Cause::die(Defect::new("x")))
            .both(Cause::interrupt(fiber(2)));
        assert_eq!(cause.interruptors(), BTreeSet::from([fiber(1), fiber(2)]));
    }

    #[test]
    fn test_failure_or_cause() {
        let cause = Cause::die(Defect::new("boom")).then(Cause::fail("e"));
        assert_eq!(cause.failure_or_cause(), Ok("e"));

        let cause: Cause<&str> = Cause::die(Defect::new("boom"));
        assert!(cause.failure_or_cause().is_err());
    }

    #[test]
    fn test_flat_map_keeps_shape() {
        let cause = Cause::fail(1)
            .then(Cause::die(Defect::new("d")))
            .both(Cause::fail(2));
        let mapped = cause.flat_map(|n| Cause::fail(n.to_string()));
        let expected = Cause::fail("1".to_string())
            .then(Cause::die(Defect::new("d")))
            .both(Cause::fail("2".to_string()));
        assert_eq!(mapped, expected);
    }

    #[test]
    fn test_strip_failures() {
        let cause = Cause::fail(1)
            .then(Cause::die(Defect::new("d")))
            .both(Cause::interrupt(fiber(9)));
        let stripped: Cause<Infallible> = cause.strip_failures();
        assert_eq!(stripped.size(), 2);
        assert!(!stripped.is_failure());
        assert_eq!(stripped.defects()[0].message(), "d");
    }

    #[test]
    fn test_keep_defects() {
        let cause = Cause::fail(1).then(Cause::interrupt(fiber(1)));
        assert!(cause.keep_defects::<i32>().is_none());

        let cause = Cause::fail(1).then(Cause::die(Defect::new("d")));
        let kept: Cause<i32> = cause.keep_defects().unwrap();
        assert_eq!(kept, Cause::die(Defect::new("d")));
    }

    #[test]
    fn test_find_on_deep_chain() {
        let mut cause = Cause::fail(0);
        for i in 1..10_000 {
            cause = cause.then(Cause::fail(i));
        }
        let found = cause.find(|c| match c {
            Cause::Fail(9_999) => Some(9_999),
            _ => None,
        });
        assert_eq!(found, Some(9_999));
        assert_eq!(cause.size(), 10_000);
    }

    #[test]
    fn test_defect_from_panic() {
        let payload: Box<dyn Any + Send> = Box::new("went wrong");
        assert_eq!(Defect::from_panic(payload).message(), "went wrong");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(Defect::from_panic(payload).message(), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(Defect::from_panic(payload).message(), "unknown panic");
    }

    #[test]
    fn test_defect_from_error_keeps_payload() {
        let defect = Defect::from_error(17u32);
        assert_eq!(defect.message(), "17");
        assert_eq!(defect.payload::<u32>(), Some(&17));
    }

    #[test]
    fn test_pretty_renders_branches() {
        let cause = Cause::fail("body")
            .then(Cause::die(Defect::new("release")))
            .both(Cause::interrupt(fiber(3)));
        let rendered = cause.pretty();
        assert_eq!(
            rendered,
            "Both\n  Then\n    Fail(\"body\")\n    Die(release)\n  Interrupt(#3)\n"
        );
    }

    #[test]
    fn test_widen_infallible() {
        let cause: Cause<Infallible> = Cause::die(Defect::new("d"));
        let widened: Cause<String> = cause.widen();
        assert!(widened.is_die());
    }
}
