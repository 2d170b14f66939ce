//! Per-role console adapters over the one shared engine.

use std::{collections::BTreeSet, sync::Arc};

use shared::domain::{StaffRole, ThreadId, UserId};

use crate::{
    engine::EngineHandle,
    error::SendError,
    send::ComposeDraft,
    store::StoreSnapshot,
    types::{CounterpartMeta, Message, Thread},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsoleAction {
    ViewThreads,
    SendText,
    SendAttachment,
    MarkRead,
    ViewContactDetails,
}

impl ConsoleAction {
    pub const ALL: [ConsoleAction; 5] = [
        ConsoleAction::ViewThreads,
        ConsoleAction::SendText,
        ConsoleAction::SendAttachment,
        ConsoleAction::MarkRead,
        ConsoleAction::ViewContactDetails,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            ConsoleAction::ViewThreads => "view threads",
            ConsoleAction::SendText => "send messages",
            ConsoleAction::SendAttachment => "send attachments",
            ConsoleAction::MarkRead => "mark threads read",
            ConsoleAction::ViewContactDetails => "view contact details",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    actions: BTreeSet<ConsoleAction>,
}

impl Capabilities {
    /// The three staff consoles share one messaging surface.
    pub fn for_role(_role: StaffRole) -> Self {
        Self::from_actions(ConsoleAction::ALL)
    }

    pub fn from_actions(actions: impl IntoIterator<Item = ConsoleAction>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }

    pub fn allows(&self, action: ConsoleAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn actions(&self) -> impl Iterator<Item = ConsoleAction> + '_ {
        self.actions.iter().copied()
    }
}

/// One staff console: the shared engine seen through a role's capabilities.
#[derive(Clone)]
pub struct ConsoleAdapter {
    engine: EngineHandle,
    capabilities: Arc<Capabilities>,
}

impl ConsoleAdapter {
    pub fn new(engine: EngineHandle) -> Self {
        let capabilities = Capabilities::for_role(engine.role());
        Self::with_capabilities(engine, capabilities)
    }

    pub fn with_capabilities(engine: EngineHandle, capabilities: Capabilities) -> Self {
        Self {
            engine,
            capabilities: Arc::new(capabilities),
        }
    }

    pub fn actor(&self) -> &UserId {
        self.engine.actor()
    }

    pub fn role(&self) -> StaffRole {
        self.engine.role()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    fn require(&self, action: ConsoleAction) -> Result<(), SendError> {
        if self.capabilities.allows(action) {
            Ok(())
        } else {
            Err(SendError::NotPermitted {
                role: self.role(),
                action: action.describe(),
            })
        }
    }

    /// Thread list, most recent first. Empty when the role may not view it.
    pub fn threads(&self) -> Vec<Thread> {
        if !self.capabilities.allows(ConsoleAction::ViewThreads) {
            return Vec::new();
        }
        self.engine.snapshot().threads.clone()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.engine.snapshot()
    }

    pub async fn open_thread(&self, thread_id: &ThreadId) -> Result<Thread, SendError> {
        self.require(ConsoleAction::ViewThreads)?;
        self.engine
            .open_thread(thread_id)
            .await
            .ok_or_else(|| SendError::UnknownThread(thread_id.clone()))
    }

    pub async fn send(&self, thread_id: &ThreadId, draft: &ComposeDraft) -> Result<Message, SendError> {
        self.require(ConsoleAction::SendText)?;
        if draft.attachment.is_some() {
            self.require(ConsoleAction::SendAttachment)?;
        }
        self.engine.send(thread_id, draft).await
    }

    pub async fn mark_read(&self, thread_id: &ThreadId) -> Result<bool, SendError> {
        self.require(ConsoleAction::MarkRead)?;
        self.engine
            .mark_read(thread_id)
            .await
            .map_err(SendError::from)
    }

    /// Cached directory details for the thread's counterpart.
    pub fn contact_details(&self, thread_id: &ThreadId) -> Option<CounterpartMeta> {
        if !self.capabilities.allows(ConsoleAction::ViewContactDetails) {
            return None;
        }
        self.engine
            .snapshot()
            .thread_by_id(thread_id)
            .and_then(|thread| thread.counterpart_meta.clone())
    }
}
