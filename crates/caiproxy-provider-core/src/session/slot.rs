use std::sync::Arc;
use std::time::SystemTime;

use crate::backend::BackendConnection;
use crate::conversation::{ConversationBranch, ConversationState};
use crate::credential::ConversationHandle;

/// Per-key state guarded by the key's mutex.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub session: Option<LiveSession>,
    pub conversation: Option<ConversationState>,
    pub branches: Vec<ConversationBranch>,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.conversation.is_none() && self.branches.is_empty()
    }

    /// Drop a branch. Clears the active conversation if it was that one.
    pub fn forget(&mut self, chat_id: &ConversationHandle) -> bool {
        let before = self.branches.len();
        self.branches.retain(|b| &b.chat_id != chat_id);
        let removed = self.branches.len() != before;
        let was_active = self
            .conversation
            .as_ref()
            .is_some_and(|state| &state.handle == chat_id);
        if was_active {
            self.conversation = None;
        }
        removed || was_active
    }
}

#[derive(Debug)]
pub(crate) struct LiveSession {
    pub connection: Arc<BackendConnection>,
    pub opened_at: SystemTime,
    pub last_used: SystemTime,
}
