//! Reactive boolean flags with combinator aggregation.
//!
//! Flags are the engine's only synchronization primitive. A flag is either
//! *explicit* (its value changes only via [`FlagArena::set`] /
//! [`FlagArena::unset`]) or a *combinator* whose value is derived from its
//! attached children (AND or OR). Value transitions are edge-triggered:
//! each one records a wake event the owner drains and turns into signals.
//!
//! Combinator recomputation runs as an explicit work-list processed to a
//! fixed point, so cascades through nested combinators are bounded and
//! never recurse.

use std::collections::VecDeque;

/// Index of a flag within a [`FlagArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagId(u32);

/// Direction of a flag transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The flag went from unset to set.
    Rising,
    /// The flag went from set to unset.
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    Explicit,
    All { default_when_empty: bool },
    Any { default_when_empty: bool },
}

#[derive(Debug)]
struct Flag<W> {
    value: bool,
    changing: bool,
    parent: Option<FlagId>,
    combine: Combine,
    num_set: u32,
    num_unset: u32,
    wake: Option<W>,
    alive: bool,
}

/// Arena of flags with parent/child combinator edges.
///
/// `W` is the wake token attached to flags the owner wants transition
/// events for; events are drained with [`FlagArena::drain_events`].
#[derive(Debug)]
pub struct FlagArena<W> {
    flags: Vec<Flag<W>>,
    free: Vec<u32>,
    events: VecDeque<(W, Edge)>,
}

impl<W: Copy> FlagArena<W> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            flags: Vec::new(),
            free: Vec::new(),
            events: VecDeque::new(),
        }
    }

    fn insert(&mut self, flag: Flag<W>) -> FlagId {
        if let Some(idx) = self.free.pop() {
            self.flags[idx as usize] = flag;
            FlagId(idx)
        } else {
            self.flags.push(flag);
            FlagId((self.flags.len() - 1) as u32)
        }
    }

    fn flag(&self, id: FlagId) -> &Flag<W> {
        let f = &self.flags[id.0 as usize];
        debug_assert!(f.alive, "use of freed flag");
        f
    }

    fn flag_mut(&mut self, id: FlagId) -> &mut Flag<W> {
        let f = &mut self.flags[id.0 as usize];
        debug_assert!(f.alive, "use of freed flag");
        f
    }

    /// Allocates an explicit flag with the given initial value.
    pub fn alloc(&mut self, initial: bool, wake: Option<W>) -> FlagId {
        self.insert(Flag {
            value: initial,
            changing: false,
            parent: None,
            combine: Combine::Explicit,
            num_set: 0,
            num_unset: 0,
            wake,
            alive: true,
        })
    }

    /// Allocates an AND combinator.
    ///
    /// With children attached it is set iff no child is unset and at least
    /// one child is set; with none attached it holds `default_when_empty`.
    pub fn alloc_all(&mut self, default_when_empty: bool, wake: Option<W>) -> FlagId {
        self.insert(Flag {
            value: default_when_empty,
            changing: false,
            parent: None,
            combine: Combine::All { default_when_empty },
            num_set: 0,
            num_unset: 0,
            wake,
            alive: true,
        })
    }

    /// Allocates an OR combinator.
    ///
    /// With children attached it is set iff any child is set; with none
    /// attached it holds `default_when_empty`.
    pub fn alloc_any(&mut self, default_when_empty: bool, wake: Option<W>) -> FlagId {
        self.insert(Flag {
            value: default_when_empty,
            changing: false,
            parent: None,
            combine: Combine::Any { default_when_empty },
            num_set: 0,
            num_unset: 0,
            wake,
            alive: true,
        })
    }

    /// Frees a flag, detaching it from its parent first.
    ///
    /// Children of a freed combinator must be detached by the caller
    /// beforehand.
    pub fn free(&mut self, id: FlagId) {
        self.detach(id);
        let f = &mut self.flags[id.0 as usize];
        debug_assert!(f.alive, "double free of flag");
        debug_assert!(
            f.num_set == 0 && f.num_unset == 0,
            "freeing combinator with attached children"
        );
        f.alive = false;
        f.wake = None;
        self.free.push(id.0);
    }

    /// Returns true if the flag is set and no request is in flight.
    pub fn is_set(&self, id: FlagId) -> bool {
        let f = self.flag(id);
        f.value && !f.changing
    }

    /// Returns true if the flag is unset and no request is in flight.
    pub fn is_unset(&self, id: FlagId) -> bool {
        let f = self.flag(id);
        !f.value && !f.changing
    }

    /// Returns the raw boolean value, ignoring the changing mark.
    pub fn raw_value(&self, id: FlagId) -> bool {
        self.flag(id).value
    }

    /// Returns true if a request is in flight for this flag.
    pub fn is_changing(&self, id: FlagId) -> bool {
        self.flag(id).changing
    }

    /// Returns true if the flag is attached to a parent combinator.
    pub fn has_parent(&self, id: FlagId) -> bool {
        self.flag(id).parent.is_some()
    }

    /// Marks a request as in flight; the flag is excluded from predicates
    /// until it resolves.
    pub fn set_changing(&mut self, id: FlagId) {
        self.flag_mut(id).changing = true;
    }

    /// Clears the in-flight mark without changing the value.
    pub fn cancel_changing(&mut self, id: FlagId) {
        self.flag_mut(id).changing = false;
    }

    /// Sets an explicit flag. Clears the in-flight mark; a no-op set fires
    /// no event.
    pub fn set(&mut self, id: FlagId) {
        self.assign(id, true);
    }

    /// Unsets an explicit flag. Clears the in-flight mark; a no-op unset
    /// fires no event.
    pub fn unset(&mut self, id: FlagId) {
        self.assign(id, false);
    }

    fn assign(&mut self, id: FlagId, value: bool) {
        debug_assert!(
            matches!(self.flag(id).combine, Combine::Explicit),
            "explicit assignment to a combinator flag"
        );
        self.flag_mut(id).changing = false;
        let mut work = VecDeque::new();
        self.apply_value(id, value, &mut work);
        self.run_worklist(work);
    }

    /// Attaches `child` under `parent`, updating the parent's counters and
    /// recomputing it (which may cascade further up).
    pub fn attach(&mut self, child: FlagId, parent: FlagId) {
        debug_assert!(
            !matches!(self.flag(parent).combine, Combine::Explicit),
            "attach target must be a combinator"
        );
        debug_assert!(self.flag(child).parent.is_none(), "flag already attached");
        let value = self.flag(child).value;
        self.flag_mut(child).parent = Some(parent);
        {
            let p = self.flag_mut(parent);
            if value {
                p.num_set += 1;
            } else {
                p.num_unset += 1;
            }
        }
        let mut work = VecDeque::new();
        work.push_back(parent);
        self.run_worklist(work);
    }

    /// Detaches a flag from its parent, the exact inverse of
    /// [`FlagArena::attach`]. A flag without a parent is left untouched.
    pub fn detach(&mut self, child: FlagId) {
        let Some(parent) = self.flag_mut(child).parent.take() else {
            return;
        };
        let value = self.flag(child).value;
        {
            let p = self.flag_mut(parent);
            if value {
                p.num_set -= 1;
            } else {
                p.num_unset -= 1;
            }
        }
        let mut work = VecDeque::new();
        work.push_back(parent);
        self.run_worklist(work);
    }

    /// Drains the transition events recorded since the last drain, in
    /// occurrence order.
    pub fn drain_events(&mut self) -> Vec<(W, Edge)> {
        self.events.drain(..).collect()
    }

    fn computed_value(&self, id: FlagId) -> bool {
        let f = self.flag(id);
        match f.combine {
            Combine::Explicit => f.value,
            Combine::All { default_when_empty } => {
                if f.num_set == 0 && f.num_unset == 0 {
                    default_when_empty
                } else {
                    f.num_unset == 0 && f.num_set > 0
                }
            }
            Combine::Any { default_when_empty } => {
                if f.num_set == 0 && f.num_unset == 0 {
                    default_when_empty
                } else {
                    f.num_set > 0
                }
            }
        }
    }

    fn apply_value(&mut self, id: FlagId, value: bool, work: &mut VecDeque<FlagId>) {
        let old = self.flag(id).value;
        if old == value {
            return;
        }
        self.flag_mut(id).value = value;
        if let Some(wake) = self.flag(id).wake {
            let edge = if value { Edge::Rising } else { Edge::Falling };
            self.events.push_back((wake, edge));
        }
        if let Some(parent) = self.flag(id).parent {
            let p = self.flag_mut(parent);
            if value {
                p.num_unset -= 1;
                p.num_set += 1;
            } else {
                p.num_set -= 1;
                p.num_unset += 1;
            }
            work.push_back(parent);
        }
    }

    fn run_worklist(&mut self, mut work: VecDeque<FlagId>) {
        while let Some(id) = work.pop_front() {
            let value = self.computed_value(id);
            self.apply_value(id, value, &mut work);
        }
    }
}

impl<W: Copy> Default for FlagArena<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum W {
        A,
        B,
        Top,
    }

    #[test]
    fn explicit_set_unset() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let f = arena.alloc(false, Some(W::A));
        assert!(arena.is_unset(f));

        arena.set(f);
        assert!(arena.is_set(f));
        assert_eq!(arena.drain_events(), vec![(W::A, Edge::Rising)]);

        // Redundant set fires no event.
        arena.set(f);
        assert!(arena.drain_events().is_empty());

        arena.unset(f);
        assert_eq!(arena.drain_events(), vec![(W::A, Edge::Falling)]);
    }

    #[test]
    fn changing_excluded_from_predicates() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let f = arena.alloc(false, None);
        arena.set_changing(f);
        assert!(!arena.is_set(f));
        assert!(!arena.is_unset(f));

        arena.cancel_changing(f);
        assert!(arena.is_unset(f));

        // An explicit assignment resolves the in-flight request.
        arena.set_changing(f);
        arena.set(f);
        assert!(arena.is_set(f));
    }

    #[test]
    fn and_combinator_algebra() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_all(false, Some(W::Top));
        assert!(arena.is_unset(top));

        let a = arena.alloc(false, None);
        let b = arena.alloc(false, None);
        arena.attach(a, top);
        arena.attach(b, top);
        assert!(arena.is_unset(top));

        arena.set(a);
        assert!(arena.is_unset(top), "one unset child keeps AND unset");
        arena.set(b);
        assert!(arena.is_set(top));
        assert_eq!(arena.drain_events(), vec![(W::Top, Edge::Rising)]);

        arena.unset(a);
        assert!(arena.is_unset(top));
        assert_eq!(arena.drain_events(), vec![(W::Top, Edge::Falling)]);
    }

    #[test]
    fn or_combinator_algebra() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_any(false, Some(W::Top));
        let a = arena.alloc(false, None);
        let b = arena.alloc(false, None);
        arena.attach(a, top);
        arena.attach(b, top);

        arena.set(a);
        assert!(arena.is_set(top));
        arena.set(b);
        arena.unset(a);
        assert!(arena.is_set(top), "one set child keeps OR set");
        arena.unset(b);
        assert!(arena.is_unset(top));
    }

    #[test]
    fn default_when_empty_preseeds() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_all(true, Some(W::Top));
        assert!(arena.is_set(top), "empty AND holds its default");

        // First attached unset child overrides the default.
        let a = arena.alloc(false, None);
        arena.attach(a, top);
        assert!(arena.is_unset(top));
        assert_eq!(arena.drain_events(), vec![(W::Top, Edge::Falling)]);

        // Detach restores the empty default.
        arena.detach(a);
        assert!(arena.is_set(top));
    }

    #[test]
    fn attach_detach_is_inverse() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_all(false, None);
        let a = arena.alloc(true, None);
        let b = arena.alloc(false, None);
        arena.attach(a, top);

        let before = (arena.flag(top).num_set, arena.flag(top).num_unset);
        arena.attach(b, top);
        assert_eq!(
            (arena.flag(top).num_set, arena.flag(top).num_unset),
            (before.0, before.1 + 1)
        );
        arena.detach(b);
        assert_eq!((arena.flag(top).num_set, arena.flag(top).num_unset), before);
    }

    #[test]
    fn nested_combinators_cascade() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let root = arena.alloc_all(true, Some(W::Top));
        let mid_a = arena.alloc_all(false, Some(W::A));
        let mid_b = arena.alloc_all(false, Some(W::B));
        arena.attach(mid_a, root);
        arena.attach(mid_b, root);
        arena.drain_events();

        let a1 = arena.alloc(false, None);
        let a2 = arena.alloc(false, None);
        let b1 = arena.alloc(false, None);
        arena.attach(a1, mid_a);
        arena.attach(a2, mid_a);
        arena.attach(b1, mid_b);
        arena.drain_events();

        arena.set(a1);
        arena.set(a2);
        assert_eq!(arena.drain_events(), vec![(W::A, Edge::Rising)]);
        assert!(arena.is_unset(root));

        arena.set(b1);
        let events = arena.drain_events();
        assert!(events.contains(&(W::B, Edge::Rising)));
        assert!(events.contains(&(W::Top, Edge::Rising)));
        assert!(arena.is_set(root));
    }

    #[test]
    fn events_fire_once_per_transition() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_any(false, Some(W::Top));
        let a = arena.alloc(false, None);
        let b = arena.alloc(false, None);
        arena.attach(a, top);
        arena.attach(b, top);

        arena.set(a);
        arena.set(b);
        // Second set leaves the OR set; only one rising event total.
        assert_eq!(arena.drain_events(), vec![(W::Top, Edge::Rising)]);
    }

    #[test]
    fn free_recycles_slots() {
        let mut arena: FlagArena<W> = FlagArena::new();
        let top = arena.alloc_all(false, None);
        let a = arena.alloc(true, None);
        arena.attach(a, top);
        arena.free(a);
        assert!(arena.is_unset(top), "freed child no longer counts");

        let b = arena.alloc(false, None);
        assert_eq!(b, a, "slot is reused");
        assert!(arena.is_unset(b));
    }
}
