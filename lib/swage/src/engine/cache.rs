// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Shared machinery for the per-protocol header caches.
//!
//! Every cache follows the same discipline. It wraps one decoded
//! packet and keeps two snapshots of the packet's rewritable fields: a
//! **baseline**, hydrated field by field from the packet the first
//! time each field is read, and a **staged** snapshot, created on the
//! first setter call as a full copy of the (fully hydrated) baseline.
//! Getters prefer the staged snapshot; the packet itself is only
//! replaced at commit time, and only when a staged value actually
//! differs from the baseline.

use crate::engine::flow::FlowContext;
use alloc::boxed::Box;
use alloc::sync::Arc;
use swage_api::ActionKind;
use swage_api::MatchField;

/// A lazily hydrated header field.
///
/// `Unread` means the decoded packet has not been queried for this
/// field yet. Each field moves to `Value` at most once per snapshot;
/// a fully hydrated snapshot never consults the packet again.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Lazy<T> {
    #[default]
    Unread,
    Value(T),
}

impl<T: Copy> Lazy<T> {
    /// Read the field, querying the packet via `read` on first
    /// access.
    pub fn hydrate(&mut self, read: impl FnOnce() -> T) -> T {
        match self {
            Lazy::Value(v) => *v,
            Lazy::Unread => {
                let v = read();
                *self = Lazy::Value(v);
                v
            }
        }
    }

    /// Overwrite the field with a staged value.
    pub fn set(&mut self, val: T) {
        *self = Lazy::Value(val);
    }

    /// Read an already hydrated field.
    ///
    /// Staged snapshots are copies of a fully hydrated baseline, so
    /// within the commit path this cannot miss.
    pub fn read(&self) -> T {
        match self {
            Lazy::Value(v) => *v,
            Lazy::Unread => unreachable!("field read before hydration"),
        }
    }
}

/// The decoded packet wrapped by a cache, with copy-on-write
/// ownership.
///
/// `Borrowed` is the packet supplied at construction, possibly shared
/// with forked caches. The first applied change swaps in a private
/// copy and moves to `Owned`; [`CowPacket::fork`] demotes an owned
/// copy back to `Borrowed` before sharing it, so a chain of forks
/// costs nothing until one side writes.
#[derive(Debug)]
pub enum CowPacket<P> {
    Borrowed(Arc<P>),
    Owned(Box<P>),
}

impl<P: Clone> CowPacket<P> {
    pub fn new(pkt: P) -> Self {
        Self::Borrowed(Arc::new(pkt))
    }

    /// The current packet. Staged, uncommitted values are never
    /// visible here.
    pub fn get(&self) -> &P {
        match self {
            Self::Borrowed(pkt) => pkt,
            Self::Owned(pkt) => pkt,
        }
    }

    /// Mutable access for applying a committed change. The first
    /// write on a shared packet clones it.
    pub fn to_mut(&mut self) -> &mut P {
        if let Self::Borrowed(shared) = self {
            *self = Self::Owned(Box::new(P::clone(shared)));
        }

        match self {
            Self::Owned(pkt) => pkt,
            // We just forced the owned state above.
            Self::Borrowed(_) => unreachable!(),
        }
    }

    /// True once a private copy has been taken.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// Split off a handle for an independent processing path.
    ///
    /// An owned copy is first published as the new shared packet, so
    /// neither side can write through to the other; the next applied
    /// change on either side takes its own copy.
    pub fn fork(&mut self) -> Self {
        if let Self::Owned(pkt) = self {
            let pkt = Arc::new(P::clone(pkt));
            *self = Self::Borrowed(pkt);
        }

        match self {
            Self::Borrowed(shared) => Self::Borrowed(Arc::clone(shared)),
            Self::Owned(_) => unreachable!(),
        }
    }
}

/// Reconcile one staged field against the flow's runtime context.
///
/// A staged value that differs from the baseline is a real rewrite:
/// report it so the caller applies the change. A staged value equal to
/// the baseline is a no-op; if the flow additionally matches on the
/// field, the pending rewrite action is redundant (the match already
/// guarantees the value) and is dropped from the context.
pub(crate) fn reconcile_field<T, C>(
    ctx: &mut C,
    field: MatchField,
    action: ActionKind,
    base: &T,
    staged: &T,
) -> bool
where
    T: PartialEq,
    C: FlowContext + ?Sized,
{
    if staged != base {
        return true;
    }

    if ctx.has_match_field(field) {
        ctx.remove_filter_action(action);
    }

    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow::PendingFlow;

    #[test]
    fn lazy_hydrates_once() {
        let mut field = Lazy::<u16>::default();
        let mut queries = 0;
        assert_eq!(
            field.hydrate(|| {
                queries += 1;
                443
            }),
            443
        );
        assert_eq!(
            field.hydrate(|| {
                queries += 1;
                unreachable!("field already hydrated")
            }),
            443
        );
        assert_eq!(queries, 1);
    }

    #[test]
    fn cow_clones_on_first_write_only() {
        let mut cow = CowPacket::new(vec![1u8, 2, 3]);
        assert!(!cow.is_owned());

        cow.to_mut().push(4);
        assert!(cow.is_owned());
        let before = cow.get().as_ptr();
        cow.to_mut().push(5);
        assert_eq!(cow.get().as_ptr(), before);
        assert_eq!(cow.get(), &vec![1u8, 2, 3, 4, 5]);
    }

    #[test]
    fn fork_isolates_writes() {
        let mut a = CowPacket::new(vec![1u8]);
        a.to_mut().push(2);

        let mut b = a.fork();
        assert!(!a.is_owned());
        assert!(!b.is_owned());

        b.to_mut().push(3);
        assert_eq!(a.get(), &vec![1u8, 2]);
        assert_eq!(b.get(), &vec![1u8, 2, 3]);
    }

    #[test]
    fn reconcile_drops_redundant_action() {
        let mut ctx = PendingFlow::default();
        ctx.add_match_field(MatchField::EtherDst);
        ctx.push_action(ActionKind::SetEtherDst);
        ctx.push_action(ActionKind::SetEtherSrc);

        // Unchanged + matched: the action goes away.
        assert!(!reconcile_field(
            &mut ctx,
            MatchField::EtherDst,
            ActionKind::SetEtherDst,
            &7u16,
            &7u16,
        ));
        assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);

        // Unchanged + unmatched: nothing happens.
        assert!(!reconcile_field(
            &mut ctx,
            MatchField::EtherSrc,
            ActionKind::SetEtherSrc,
            &7u16,
            &7u16,
        ));
        assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);

        // Changed: real modification, action stays.
        assert!(reconcile_field(
            &mut ctx,
            MatchField::EtherSrc,
            ActionKind::SetEtherSrc,
            &7u16,
            &8u16,
        ));
        assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);
    }
}
