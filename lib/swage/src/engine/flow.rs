// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The runtime context the commit protocol reconciles against.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;
pub use swage_api::ActionKind;
pub use swage_api::MatchField;

/// Per-packet runtime state consulted and adjusted by `commit`.
///
/// The surrounding pipeline tracks which match fields will constrain
/// the flow being built for this packet, along with the rewrite
/// actions queued for outgoing packets. The caches only need this
/// narrow view of it: membership tests, marking a field mandatory, and
/// dropping a rewrite action that the match has made redundant.
pub trait FlowContext {
    /// Does the flow already match on `field`?
    fn has_match_field(&self, field: MatchField) -> bool;

    /// Mark `field` as mandatory for the flow match.
    fn add_match_field(&mut self, field: MatchField);

    /// Drop every pending rewrite action of the given kind.
    fn remove_filter_action(&mut self, kind: ActionKind);
}

/// A self-contained [`FlowContext`]: the match-field set plus the
/// ordered list of pending rewrite actions.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PendingFlow {
    match_fields: BTreeSet<MatchField>,
    actions: Vec<ActionKind>,
}

impl PendingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a rewrite action for the outgoing packet.
    pub fn push_action(&mut self, kind: ActionKind) {
        self.actions.push(kind);
    }

    /// The pending rewrite actions, in the order queued.
    pub fn actions(&self) -> &[ActionKind] {
        &self.actions
    }

    /// The fields the flow match will be installed with.
    pub fn match_fields(&self) -> &BTreeSet<MatchField> {
        &self.match_fields
    }
}

impl FlowContext for PendingFlow {
    fn has_match_field(&self, field: MatchField) -> bool {
        self.match_fields.contains(&field)
    }

    fn add_match_field(&mut self, field: MatchField) {
        self.match_fields.insert(field);
    }

    fn remove_filter_action(&mut self, kind: ActionKind) {
        self.actions.retain(|a| *a != kind);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remove_drops_every_occurrence() {
        let mut flow = PendingFlow::new();
        flow.push_action(ActionKind::SetDscp);
        flow.push_action(ActionKind::SetIp4Src);
        flow.push_action(ActionKind::SetDscp);

        flow.remove_filter_action(ActionKind::SetDscp);
        assert_eq!(flow.actions(), [ActionKind::SetIp4Src]);

        // Removing an absent kind is a no-op.
        flow.remove_filter_action(ActionKind::SetDscp);
        assert_eq!(flow.actions(), [ActionKind::SetIp4Src]);
    }
}
