//! Authoritative per-counterpart conversation state.
//!
//! [`ThreadStore`] is the only writer of thread state. Every message, no
//! matter where it came from, goes through the same id-keyed, order-keeping
//! merge. Readers get immutable [`StoreSnapshot`]s through a `watch` channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, ThreadId, UserId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    ledger::DedupLedger,
    types::{CounterpartMeta, HydratedThread, Message, Thread},
};

/// Live events held while no hydrate has completed.
pub const DEFAULT_LIVE_BUFFER_LIMIT: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    /// A provisional send was superseded in place by its confirmed echo.
    Reconciled { index: usize },
    Duplicate,
    /// Held until the in-flight hydrate completes.
    Buffered,
    /// No thread exists for the message's counterpart; the message was dropped.
    Unresolved,
}

impl MergeOutcome {
    pub fn changed_state(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted { .. } | MergeOutcome::Reconciled { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrateReport {
    pub threads_created: usize,
    pub messages_merged: usize,
    pub duplicates: usize,
    pub replayed: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HydrateState {
    NotStarted,
    InFlight,
    Complete,
}

/// Immutable view of the store at one version.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub version: u64,
    pub hydrated: bool,
    /// Threads ordered by most recent activity first.
    pub threads: Vec<Thread>,
}

impl StoreSnapshot {
    pub fn thread(&self, counterpart: &UserId) -> Option<&Thread> {
        self.threads
            .iter()
            .find(|thread| thread.counterpart_id() == counterpart)
    }

    pub fn thread_by_id(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|thread| &thread.id == thread_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.threads.iter().map(|thread| thread.unread_count).sum()
    }
}

pub struct ThreadStore {
    actor: UserId,
    threads: HashMap<UserId, Thread>,
    thread_index: HashMap<ThreadId, UserId>,
    ledger: DedupLedger,
    hydrate_state: HydrateState,
    hydrated_once: bool,
    buffered_live: VecDeque<Message>,
    live_buffer_limit: usize,
    buffer_overflow_warned: bool,
    provisional: HashMap<UserId, VecDeque<MessageId>>,
    version: u64,
    snapshots: watch::Sender<Arc<StoreSnapshot>>,
}

impl ThreadStore {
    pub fn new(actor: UserId, ledger: DedupLedger) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        Self {
            actor,
            threads: HashMap::new(),
            thread_index: HashMap::new(),
            ledger,
            hydrate_state: HydrateState::NotStarted,
            hydrated_once: false,
            buffered_live: VecDeque::new(),
            live_buffer_limit: DEFAULT_LIVE_BUFFER_LIMIT,
            buffer_overflow_warned: false,
            provisional: HashMap::new(),
            version: 0,
            snapshots,
        }
    }

    pub fn with_live_buffer_limit(mut self, limit: usize) -> Self {
        self.live_buffer_limit = limit.max(1);
        self
    }

    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrate_state == HydrateState::Complete
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_live.len()
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn thread(&self, counterpart: &UserId) -> Option<&Thread> {
        self.threads.get(counterpart)
    }

    pub fn thread_by_id(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.thread_index
            .get(thread_id)
            .and_then(|counterpart| self.threads.get(counterpart))
    }

    /// Mark a hydrate as in flight. Live events are buffered until
    /// [`ThreadStore::hydrate`] runs.
    pub fn begin_hydrate(&mut self) {
        if self.hydrate_state != HydrateState::InFlight {
            debug!("store: hydrate started; buffering live events");
        }
        self.hydrate_state = HydrateState::InFlight;
    }

    /// Give up on an in-flight hydrate whose fetch failed. A store that was
    /// hydrated before goes back to live merging and replays what it held.
    pub fn abort_hydrate(&mut self) -> usize {
        if self.hydrate_state != HydrateState::InFlight {
            return 0;
        }
        if !self.hydrated_once {
            self.hydrate_state = HydrateState::NotStarted;
            return 0;
        }
        self.hydrate_state = HydrateState::Complete;
        let buffered = self.drain_buffer();
        let replayed = buffered.len();
        for message in buffered {
            self.merge_resolved_live(message);
        }
        warn!(replayed, "store: hydrate aborted; resuming live merges");
        self.publish();
        replayed
    }

    /// Bulk merge of the REST history, followed by replay of every live event
    /// that arrived before it.
    pub fn hydrate(&mut self, batch: Vec<HydratedThread>) -> HydrateReport {
        let mut report = HydrateReport::default();

        for hydrated in batch {
            let counterpart = hydrated.counterpart_id.clone();
            if counterpart == self.actor {
                warn!(thread_id = %hydrated.thread_id, "store: thread record has no counterpart; skipping");
                continue;
            }
            match self.threads.get(&counterpart) {
                Some(existing) if existing.id != hydrated.thread_id => {
                    warn!(
                        thread_id = %hydrated.thread_id,
                        existing_thread_id = %existing.id,
                        counterpart_id = %counterpart,
                        "store: second thread record for counterpart; folding into existing thread"
                    );
                }
                Some(_) => {}
                None => {
                    let last_activity = hydrated.last_activity.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    self.threads.insert(
                        counterpart.clone(),
                        Thread::new(hydrated.thread_id.clone(), counterpart.clone(), last_activity),
                    );
                    report.threads_created += 1;
                }
            }
            self.thread_index
                .insert(hydrated.thread_id.clone(), counterpart.clone());
            if let (Some(activity), Some(thread)) =
                (hydrated.last_activity, self.threads.get_mut(&counterpart))
            {
                if activity > thread.last_activity {
                    thread.last_activity = activity;
                }
            }

            let mut messages = hydrated.messages;
            messages.sort_by_key(|message| message.created_at);
            for message in messages {
                match self.merge_confirmed(&counterpart, message) {
                    MergeOutcome::Inserted { .. } | MergeOutcome::Reconciled { .. } => {
                        report.messages_merged += 1
                    }
                    _ => report.duplicates += 1,
                }
            }
        }

        self.hydrate_state = HydrateState::Complete;
        self.hydrated_once = true;
        let buffered = self.drain_buffer();
        for message in buffered {
            report.replayed += 1;
            if self.merge_resolved_live(message) == MergeOutcome::Unresolved {
                report.unresolved += 1;
            }
        }

        info!(
            threads_created = report.threads_created,
            messages_merged = report.messages_merged,
            duplicates = report.duplicates,
            replayed = report.replayed,
            unresolved = report.unresolved,
            "store: hydrate merged"
        );
        self.publish();
        report
    }

    /// Merge one live push message.
    pub fn merge_live(&mut self, message: Message) -> MergeOutcome {
        if self.hydrate_state != HydrateState::Complete {
            self.buffer_live(message);
            return MergeOutcome::Buffered;
        }
        let outcome = self.merge_resolved_live(message);
        if outcome.changed_state() {
            self.publish();
        }
        outcome
    }

    /// Merge a locally synthesized send. `provisional` marks a temporary id
    /// that a later push echo should supersede.
    pub fn merge_optimistic(&mut self, mut message: Message, provisional: bool) -> MergeOutcome {
        let Some(counterpart) = self.resolve_counterpart(&message) else {
            warn!(message_id = %message.id, "store: optimistic send for unknown thread dropped");
            return MergeOutcome::Unresolved;
        };
        message.is_read = true;
        let id = message.id.clone();
        let outcome = self.merge_into(&counterpart, message);
        if let MergeOutcome::Inserted { .. } = outcome {
            if provisional {
                self.provisional.entry(counterpart).or_default().push_back(id);
            }
            self.publish();
        }
        outcome
    }

    /// Mark every counterpart message in the thread as read. Returns whether
    /// anything changed.
    pub fn mark_read(&mut self, thread_id: &ThreadId) -> bool {
        let Some(thread) = self
            .thread_index
            .get(thread_id)
            .and_then(|counterpart| self.threads.get_mut(counterpart))
        else {
            return false;
        };
        if thread.unread_count == 0 {
            return false;
        }
        let counterpart = thread.counterpart_id().clone();
        for message in thread
            .messages
            .iter_mut()
            .filter(|message| message.sender_id == counterpart)
        {
            message.is_read = true;
        }
        thread.recount_unread();
        self.publish();
        true
    }

    pub fn set_counterpart_meta(&mut self, counterpart: &UserId, meta: CounterpartMeta) -> bool {
        let Some(thread) = self.threads.get_mut(counterpart) else {
            return false;
        };
        if thread.counterpart_meta.as_ref() == Some(&meta) {
            return false;
        }
        thread.counterpart_meta = Some(meta);
        self.publish();
        true
    }

    pub fn threads_missing_meta(&self) -> Vec<UserId> {
        let mut missing: Vec<UserId> = self
            .threads
            .values()
            .filter(|thread| thread.counterpart_meta.is_none())
            .map(|thread| thread.counterpart_id().clone())
            .collect();
        missing.sort();
        missing
    }

    pub fn sweep_ledger(&mut self) -> usize {
        self.ledger.sweep()
    }

    fn buffer_live(&mut self, message: Message) {
        debug!(message_id = %message.id, "store: buffering live event until hydrate completes");
        self.buffered_live.push_back(message);
        if self.buffered_live.len() <= self.live_buffer_limit {
            return;
        }
        let limit = self.live_buffer_limit;
        // With no hydrate in flight the next history fetch starts after the
        // dropped events, so it returns them.
        if self.hydrate_state == HydrateState::NotStarted {
            self.buffered_live.pop_front();
            if !self.buffer_overflow_warned {
                warn!(limit, "store: live buffer full before first hydrate; dropping oldest events");
            }
        } else if !self.buffer_overflow_warned {
            warn!(
                buffered = self.buffered_live.len(),
                limit,
                "store: live buffer above limit while hydrate is in flight"
            );
        }
        self.buffer_overflow_warned = true;
    }

    fn drain_buffer(&mut self) -> VecDeque<Message> {
        self.buffer_overflow_warned = false;
        std::mem::take(&mut self.buffered_live)
    }

    fn resolve_counterpart(&self, message: &Message) -> Option<UserId> {
        if let Some(counterpart) = message
            .thread_id
            .as_ref()
            .and_then(|thread_id| self.thread_index.get(thread_id))
        {
            return Some(counterpart.clone());
        }
        message
            .counterpart_for(&self.actor)
            .filter(|counterpart| self.threads.contains_key(*counterpart))
            .cloned()
    }

    fn merge_resolved_live(&mut self, message: Message) -> MergeOutcome {
        if self.ledger.seen(&message.id) {
            debug!(message_id = %message.id, "store: duplicate live event ignored");
            return MergeOutcome::Duplicate;
        }
        let Some(counterpart) = self.resolve_counterpart(&message) else {
            warn!(
                message_id = %message.id,
                sender_id = %message.sender_id,
                "store: live event references no known thread; dropped"
            );
            return MergeOutcome::Unresolved;
        };
        self.merge_confirmed(&counterpart, message)
    }

    /// Merge a server-confirmed message. A self-authored one may supersede a
    /// pending provisional send, but never when the thread already holds its id.
    fn merge_confirmed(&mut self, counterpart: &UserId, message: Message) -> MergeOutcome {
        if self.ledger.seen(&message.id) {
            return MergeOutcome::Duplicate;
        }
        let Some(thread) = self.threads.get(counterpart) else {
            return MergeOutcome::Unresolved;
        };
        if thread.contains(&message.id) {
            debug!(message_id = %message.id, "store: message already in thread");
            self.ledger.record(message.id);
            return MergeOutcome::Duplicate;
        }
        if message.sender_id == self.actor {
            if let Some(index) = self.reconcile_provisional(counterpart, &message) {
                return MergeOutcome::Reconciled { index };
            }
        }
        self.merge_into(counterpart, message)
    }

    fn reconcile_provisional(&mut self, counterpart: &UserId, echo: &Message) -> Option<usize> {
        let pending = self.provisional.get_mut(counterpart)?;
        let thread = self.threads.get_mut(counterpart)?;
        let echo_text = echo.text.as_deref().map(str::trim);

        let slot = pending.iter().position(|temp_id| {
            thread.messages.iter().any(|existing| {
                &existing.id == temp_id
                    && existing.text.as_deref().map(str::trim) == echo_text
                    && existing.attachment_name() == echo.attachment_name()
            })
        })?;
        let temp_id = pending.remove(slot)?;
        let position = thread
            .messages
            .iter()
            .position(|existing| existing.id == temp_id)?;

        let mut confirmed = thread.remove_message(position);
        confirmed.id = echo.id.clone();
        confirmed.created_at = echo.created_at;
        if let (Some(local), Some(remote)) = (confirmed.attachment.as_mut(), echo.attachment.as_ref())
        {
            if local.url.is_none() {
                local.url = remote.url.clone();
            }
        }
        let index = thread.insert_ordered(confirmed);
        debug!(%temp_id, confirmed_id = %echo.id, "store: provisional send confirmed by echo");
        self.ledger.record(echo.id.clone());
        Some(index)
    }

    fn merge_into(&mut self, counterpart: &UserId, mut message: Message) -> MergeOutcome {
        if self.ledger.seen(&message.id) {
            return MergeOutcome::Duplicate;
        }
        let Some(thread) = self.threads.get_mut(counterpart) else {
            return MergeOutcome::Unresolved;
        };
        if thread.contains(&message.id) {
            self.ledger.record(message.id);
            return MergeOutcome::Duplicate;
        }
        if message.thread_id.is_none() {
            message.thread_id = Some(thread.id.clone());
        }
        let id = message.id.clone();
        let index = thread.insert_ordered(message);
        self.ledger.record(id);
        MergeOutcome::Inserted { index }
    }

    fn publish(&mut self) {
        self.version += 1;
        let mut threads: Vec<Thread> = self.threads.values().cloned().collect();
        threads.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.snapshots.send_replace(Arc::new(StoreSnapshot {
            version: self.version,
            hydrated: self.is_hydrated(),
            threads,
        }));
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
