use crate::types::{ActorRef, WorkflowId};
use crate::update::MemberUpdate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One actor's pending multi-index update, as appended to a workflow queue.
///
/// Records are immutable once created; queue removal compares them by
/// `workflow_id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub actor: ActorRef,
    pub member_updates: BTreeMap<String, MemberUpdate>,
}

impl WorkflowRecord {
    pub fn new(actor: ActorRef, member_updates: BTreeMap<String, MemberUpdate>) -> Self {
        WorkflowRecord {
            workflow_id: uuid::Uuid::new_v4(),
            actor,
            member_updates,
        }
    }
}

impl PartialEq for WorkflowRecord {
    fn eq(&self, other: &Self) -> bool {
        self.workflow_id == other.workflow_id
    }
}

impl Eq for WorkflowRecord {}
