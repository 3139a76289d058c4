// 🪝 Vote lifecycle hooks
// The only two points where outside policy runs synchronously:
//   will_rate - before anything is read or written; may veto
//   rated     - after the vote committed; notification only

use crate::engine::{Ballot, VoteResult};
use crate::entity::EntityRef;
use crate::identity::Voter;

#[derive(Debug, Clone, Copy)]
pub struct VoteEvent<'a> {
    pub entity: EntityRef,
    pub field: &'a str,
    pub ballot: Ballot,
    pub voter: &'a Voter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Proceed,
    Veto { reason: String },
}

pub trait VoteHook: Send + Sync {
    fn will_rate(&self, _event: &VoteEvent<'_>) -> HookDecision {
        HookDecision::Proceed
    }

    fn rated(&self, _event: &VoteEvent<'_>, _result: &VoteResult) {}
}
