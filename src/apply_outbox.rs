//! Reliable delivery of flag apply events.
//!
//! Every time the host application actually uses a resolved flag value, an apply event is recorded
//! here, keyed by `(resolve token, flag name)`. The outbox is a delivery queue, not a log: events
//! are deduplicated on first use, persisted before [`ApplyOutbox::record`] returns, drained to the
//! service in bounded batches, and pruned once the service has acknowledged them.
//!
//! Crash safety comes from the status field on each event. `Created` events are pending. A batch
//! is flipped to `Sending` (and persisted) right before the request goes out; on success the batch
//! is pruned, on failure it reverts to `Created` and waits for the next trigger. A `Sending` event
//! found when loading the snapshot means the process died mid-flight with an unknown outcome, so
//! it is demoted to `Created` and sent again: at-least-once delivery, never at-most-once.
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{AppliedFlag, ApplyFlagsRequest, ApplyFlagsResponse, Sdk, APPLY_ENDPOINT};
use crate::storage::Storage;
use crate::transport::TransportClient;
use crate::Result;

/// Maximum number of events sent in one apply request.
pub const APPLY_BATCH_SIZE: usize = 20;

/// Delivery state of one apply event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyEventStatus {
    /// Recorded, waiting to be sent.
    Created,
    /// Part of an in-flight batch.
    Sending,
    /// Acknowledged by the service.
    Sent,
}

/// A record that a specific flag's resolved value was used by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyEvent {
    pub flag_name: String,
    /// First time the flag was used under its resolve token. Duplicate records never overwrite it.
    #[serde(with = "crate::timestamp")]
    pub apply_time: DateTime<Utc>,
    pub status: ApplyEventStatus,
}

/// All apply events recorded under one resolve token, in accumulation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEventGroup {
    pub resolve_token: String,
    pub events: Vec<ApplyEvent>,
}

/// The persisted document: the full set of event groups, the unit of crash recovery.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboxSnapshot {
    groups: Vec<ResolveEventGroup>,
}

impl OutboxSnapshot {
    fn contains(&self, resolve_token: &str, flag: &str) -> bool {
        self.group(resolve_token)
            .is_some_and(|group| group.events.iter().any(|event| event.flag_name == flag))
    }

    fn group(&self, resolve_token: &str) -> Option<&ResolveEventGroup> {
        self.groups
            .iter()
            .find(|group| group.resolve_token == resolve_token)
    }

    fn group_mut(&mut self, resolve_token: &str) -> &mut ResolveEventGroup {
        // Vec with linear search keeps accumulation order; group counts stay small in practice.
        let position = self
            .groups
            .iter()
            .position(|group| group.resolve_token == resolve_token);
        match position {
            Some(position) => &mut self.groups[position],
            None => {
                self.groups.push(ResolveEventGroup {
                    resolve_token: resolve_token.to_owned(),
                    events: Vec::new(),
                });
                self.groups.last_mut().expect("group was just pushed")
            }
        }
    }

    fn push(&mut self, resolve_token: &str, flag: &str, apply_time: DateTime<Utc>) {
        self.group_mut(resolve_token).events.push(ApplyEvent {
            flag_name: flag.to_owned(),
            apply_time,
            status: ApplyEventStatus::Created,
        });
    }

    /// Demote in-flight events to pending. A crash mid-send is indistinguishable from a failure.
    fn demote_sending(&mut self) -> usize {
        let mut demoted = 0;
        for group in &mut self.groups {
            for event in &mut group.events {
                if event.status == ApplyEventStatus::Sending {
                    event.status = ApplyEventStatus::Created;
                    demoted += 1;
                }
            }
        }
        demoted
    }

    /// Per-group batches of pending flag names, in accumulation order.
    fn planned_batches(&self) -> Vec<(String, Vec<String>)> {
        let mut plan = Vec::new();
        for group in &self.groups {
            let pending: Vec<&str> = group
                .events
                .iter()
                .filter(|event| event.status == ApplyEventStatus::Created)
                .map(|event| event.flag_name.as_str())
                .collect();
            for chunk in pending.chunks(APPLY_BATCH_SIZE) {
                plan.push((
                    group.resolve_token.clone(),
                    chunk.iter().map(|flag| (*flag).to_owned()).collect(),
                ));
            }
        }
        plan
    }

    /// Flip the still-pending members of a planned batch to `Sending` and return their wire
    /// representation. Events another drain already claimed are skipped.
    fn mark_sending(&mut self, resolve_token: &str, flags: &[String]) -> Vec<AppliedFlag> {
        let Some(group) = self.group_mut_existing(resolve_token) else {
            return Vec::new();
        };
        let mut batch = Vec::new();
        for event in &mut group.events {
            if event.status == ApplyEventStatus::Created
                && flags.iter().any(|flag| *flag == event.flag_name)
            {
                event.status = ApplyEventStatus::Sending;
                batch.push(AppliedFlag {
                    flag: event.flag_name.clone(),
                    apply_time: event.apply_time,
                });
            }
        }
        batch
    }

    fn mark_sent(&mut self, resolve_token: &str, batch: &[AppliedFlag]) {
        self.set_status(
            resolve_token,
            batch,
            ApplyEventStatus::Sending,
            ApplyEventStatus::Sent,
        );
        // Acknowledged events are never needed again; drop them and any group they empty out.
        for group in &mut self.groups {
            group
                .events
                .retain(|event| event.status != ApplyEventStatus::Sent);
        }
        self.groups.retain(|group| !group.events.is_empty());
    }

    fn revert_to_created(&mut self, resolve_token: &str, batch: &[AppliedFlag]) {
        self.set_status(
            resolve_token,
            batch,
            ApplyEventStatus::Sending,
            ApplyEventStatus::Created,
        );
    }

    fn set_status(
        &mut self,
        resolve_token: &str,
        batch: &[AppliedFlag],
        from: ApplyEventStatus,
        to: ApplyEventStatus,
    ) {
        let Some(group) = self.group_mut_existing(resolve_token) else {
            return;
        };
        for event in &mut group.events {
            if event.status == from && batch.iter().any(|flag| flag.flag == event.flag_name) {
                event.status = to;
            }
        }
    }

    fn group_mut_existing(&mut self, resolve_token: &str) -> Option<&mut ResolveEventGroup> {
        self.groups
            .iter_mut()
            .find(|group| group.resolve_token == resolve_token)
    }

    fn pending_event_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|group| &group.events)
            .filter(|event| event.status != ApplyEventStatus::Sent)
            .count()
    }
}

/// Seam between the outbox and the wire, so delivery is testable without a server.
pub trait ApplyUploader: Send + Sync + 'static {
    /// Deliver one batch of applied flags recorded under `resolve_token`. A batch is one request,
    /// all-or-nothing.
    fn upload(
        &self,
        resolve_token: &str,
        flags: Vec<AppliedFlag>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The production [`ApplyUploader`]: posts batches through a [`TransportClient`].
pub struct ApplySender {
    transport: TransportClient,
    client_secret: String,
    sdk: Sdk,
}

impl ApplySender {
    /// Create a sender authenticating with `client_secret`.
    pub fn new(transport: TransportClient, client_secret: impl Into<String>) -> ApplySender {
        ApplySender {
            transport,
            client_secret: client_secret.into(),
            sdk: Sdk::default(),
        }
    }
}

impl ApplyUploader for ApplySender {
    async fn upload(&self, resolve_token: &str, flags: Vec<AppliedFlag>) -> Result<()> {
        let request = ApplyFlagsRequest {
            flags,
            send_time: Utc::now(),
            client_secret: self.client_secret.clone(),
            resolve_token: resolve_token.to_owned(),
            sdk: self.sdk,
        };
        let ApplyFlagsResponse {} = self.transport.post(APPLY_ENDPOINT, &request).await?;
        Ok(())
    }
}

/// A durable queue of apply events, drained against the apply endpoint until acknowledged.
///
/// Cheaply clonable; all clones share the same state. Must live inside a tokio runtime:
/// [`ApplyOutbox::record`] spawns fire-and-forget delivery passes.
pub struct ApplyOutbox<U> {
    state: Arc<Mutex<OutboxSnapshot>>,
    uploader: Arc<U>,
    storage: Arc<dyn Storage>,
}

impl<U> Clone for ApplyOutbox<U> {
    fn clone(&self) -> Self {
        ApplyOutbox {
            state: Arc::clone(&self.state),
            uploader: Arc::clone(&self.uploader),
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<U: ApplyUploader> ApplyOutbox<U> {
    /// Create an outbox, recovering any events persisted by a previous process.
    pub fn new(uploader: U, storage: Arc<dyn Storage>) -> ApplyOutbox<U> {
        let mut snapshot = load_snapshot(&*storage);
        let demoted = snapshot.demote_sending();
        if demoted > 0 {
            log::debug!(target: "beacon", "recovered {demoted} in-flight apply events as pending");
        }
        ApplyOutbox {
            state: Arc::new(Mutex::new(snapshot)),
            uploader: Arc::new(uploader),
            storage,
        }
    }

    /// Record that `flag`, resolved under `resolve_token`, was used at `apply_time`.
    ///
    /// The first record for a `(resolve_token, flag)` pair appends a pending event and persists
    /// the snapshot before returning, so a crash right after this call cannot lose the event.
    /// Later records for the same pair are no-ops, except that they re-trigger delivery — covering
    /// events stuck pending after earlier failed attempts.
    pub fn record(&self, flag: &str, resolve_token: &str, apply_time: DateTime<Utc>) {
        let document = {
            let mut state = self.lock_state();
            if state.contains(resolve_token, flag) {
                None
            } else {
                state.push(resolve_token, flag, apply_time);
                encode_snapshot(&state)
            }
        };
        if let Some(document) = document {
            self.persist(&document);
        }
        self.trigger_delivery();
    }

    /// Start a delivery pass in the background. Idempotent and safe to call redundantly: passes
    /// only claim events that are still pending, so overlapping drains never double-send.
    pub fn trigger_delivery(&self) {
        let outbox = self.clone();
        tokio::spawn(async move {
            outbox.drain_once().await;
        });
    }

    /// Run one delivery pass over the events pending right now, one request per batch.
    ///
    /// A failed batch reverts to pending and waits for the next trigger; later batches in the same
    /// pass are still attempted. Transport errors are therefore never fatal here, and persistence
    /// errors are logged and swallowed.
    pub async fn drain_once(&self) {
        let plan = self.lock_state().planned_batches();

        for (resolve_token, flags) in plan {
            let (batch, document) = {
                let mut state = self.lock_state();
                let batch = state.mark_sending(&resolve_token, &flags);
                (batch, encode_snapshot(&state))
            };
            if batch.is_empty() {
                // Another pass claimed this batch first.
                continue;
            }
            if let Some(document) = document {
                self.persist(&document);
            }

            match self.uploader.upload(&resolve_token, batch.clone()).await {
                Ok(()) => {
                    let document = {
                        let mut state = self.lock_state();
                        state.mark_sent(&resolve_token, &batch);
                        encode_snapshot(&state)
                    };
                    if let Some(document) = document {
                        self.persist(&document);
                    }
                    log::debug!(target: "beacon", "delivered {} apply events for token {resolve_token}", batch.len());
                }
                Err(err) => {
                    let document = {
                        let mut state = self.lock_state();
                        state.revert_to_created(&resolve_token, &batch);
                        encode_snapshot(&state)
                    };
                    if let Some(document) = document {
                        self.persist(&document);
                    }
                    log::warn!(target: "beacon", "apply delivery failed, {} events left pending: {err}", batch.len());
                }
            }
        }
    }

    /// Number of events not yet acknowledged by the service.
    pub fn pending_event_count(&self) -> usize {
        self.lock_state().pending_event_count()
    }

    fn persist(&self, document: &serde_json::Value) {
        if let Err(err) = self.storage.save(document) {
            log::warn!(target: "beacon", "failed to persist apply outbox: {err}");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OutboxSnapshot> {
        self.state
            .lock()
            .expect("thread holding outbox lock should not panic")
    }
}

fn encode_snapshot(snapshot: &OutboxSnapshot) -> Option<serde_json::Value> {
    match serde_json::to_value(snapshot) {
        Ok(document) => Some(document),
        Err(err) => {
            log::warn!(target: "beacon", "failed to encode outbox snapshot: {err}");
            None
        }
    }
}

fn load_snapshot(storage: &dyn Storage) -> OutboxSnapshot {
    match storage.load() {
        Ok(Some(document)) => match serde_json::from_value(document) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!(target: "beacon", "discarding unreadable outbox snapshot: {err}");
                OutboxSnapshot::default()
            }
        },
        Ok(None) => OutboxSnapshot::default(),
        Err(err) => {
            log::warn!(target: "beacon", "failed to load outbox snapshot: {err}");
            OutboxSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use chrono::TimeZone;
    use serde_json::json;

    use crate::storage::InMemoryStorage;

    use super::*;

    /// Scripted uploader: pops the front of `outcomes` per call, succeeding once the script runs
    /// out. Records every delivered batch.
    struct ScriptedUploader {
        outcomes: Mutex<VecDeque<Result<()>>>,
        calls: Mutex<Vec<(String, Vec<AppliedFlag>)>>,
    }

    impl ScriptedUploader {
        fn always_ok() -> ScriptedUploader {
            ScriptedUploader::with_outcomes([])
        }

        fn with_outcomes(outcomes: impl IntoIterator<Item = Result<()>>) -> ScriptedUploader {
            ScriptedUploader {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Vec<AppliedFlag>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ApplyUploader for Arc<ScriptedUploader> {
        async fn upload(&self, resolve_token: &str, flags: Vec<AppliedFlag>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((resolve_token.to_owned(), flags));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    fn time(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, second).unwrap()
    }

    fn network_error() -> crate::Error {
        crate::Error::RequestFailed {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            detail: None,
        }
    }

    fn persisted_groups(storage: &InMemoryStorage) -> Vec<ResolveEventGroup> {
        let document = storage.load().unwrap().expect("snapshot persisted");
        let snapshot: OutboxSnapshot = serde_json::from_value(document).unwrap();
        snapshot.groups
    }

    #[tokio::test]
    async fn record_deduplicates_on_token_and_flag() {
        let uploader = Arc::new(ScriptedUploader::with_outcomes([
            Err(network_error()),
            Err(network_error()),
        ]));
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::clone(&storage) as _);

        outbox.record("flag-a", "token-1", time(0));
        outbox.record("flag-a", "token-1", time(5));

        assert_eq!(outbox.pending_event_count(), 1);

        // First-apply-wins: the duplicate did not overwrite the original timestamp.
        let groups = persisted_groups(&storage);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].events.len(), 1);
        assert_eq!(groups[0].events[0].apply_time, time(0));
    }

    #[tokio::test]
    async fn same_flag_under_different_tokens_is_two_events() {
        let uploader = Arc::new(ScriptedUploader::with_outcomes([
            Err(network_error()),
            Err(network_error()),
        ]));
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::new(InMemoryStorage::new()) as _);

        outbox.record("flag-a", "token-1", time(0));
        outbox.record("flag-a", "token-2", time(1));

        assert_eq!(outbox.pending_event_count(), 2);
    }

    #[tokio::test]
    async fn record_persists_before_returning() {
        let uploader = Arc::new(ScriptedUploader::with_outcomes([Err(network_error())]));
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::clone(&storage) as _);

        outbox.record("flag-a", "token-1", time(0));

        // The snapshot must be durable as soon as record() returns, delivery outcome aside.
        let groups = persisted_groups(&storage);
        assert_eq!(groups[0].events[0].flag_name, "flag-a");
    }

    #[tokio::test]
    async fn successful_drain_sends_and_prunes() {
        let uploader = Arc::new(ScriptedUploader::always_ok());
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::clone(&storage) as _);

        let mut state = outbox.lock_state();
        state.push("token-1", "flag-a", time(0));
        state.push("token-1", "flag-b", time(1));
        drop(state);

        outbox.drain_once().await;

        let calls = uploader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "token-1");
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(outbox.pending_event_count(), 0);
        assert_eq!(persisted_groups(&storage), vec![]);
    }

    #[tokio::test]
    async fn failed_batch_stays_pending_while_later_batches_deliver() {
        // 25 events under one token: batch 1 (20 events) fails, batch 2 (5 events) succeeds.
        let uploader = Arc::new(ScriptedUploader::with_outcomes([Err(network_error())]));
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::clone(&storage) as _);

        {
            let mut state = outbox.lock_state();
            for i in 0..25 {
                state.push("token-1", &format!("flag-{i:02}"), time(i));
            }
        }

        outbox.drain_once().await;

        let calls = uploader.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.len(), 20);
        assert_eq!(calls[1].1.len(), 5);

        // Batch 1 reverted to pending; batch 2 acknowledged and pruned from the snapshot.
        let groups = persisted_groups(&storage);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].events.len(), 20);
        assert!(groups[0]
            .events
            .iter()
            .all(|event| event.status == ApplyEventStatus::Created));
        assert_eq!(groups[0].events[0].flag_name, "flag-00");
        assert_eq!(outbox.pending_event_count(), 20);
    }

    #[tokio::test]
    async fn batches_preserve_accumulation_order() {
        let uploader = Arc::new(ScriptedUploader::always_ok());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::new(InMemoryStorage::new()) as _);

        {
            let mut state = outbox.lock_state();
            for i in 0..25 {
                state.push("token-1", &format!("flag-{i:02}"), time(i));
            }
        }

        outbox.drain_once().await;

        let calls = uploader.calls();
        let sent: Vec<&str> = calls
            .iter()
            .flat_map(|(_, flags)| flags.iter().map(|flag| flag.flag.as_str()))
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("flag-{i:02}")).collect();
        assert_eq!(sent, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn sending_events_are_demoted_on_load() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .save(&json!({
                "groups": [{
                    "resolveToken": "token-1",
                    "events": [
                        {"flagName": "flag-a", "applyTime": "2024-05-17T12:00:00.000Z", "status": "SENDING"},
                        {"flagName": "flag-b", "applyTime": "2024-05-17T12:00:01.000Z", "status": "SENT"}
                    ]
                }]
            }))
            .unwrap();

        let uploader = Arc::new(ScriptedUploader::always_ok());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::clone(&storage) as _);

        // The demoted event is pending again and gets delivered; the sent one is not re-sent.
        outbox.drain_once().await;

        let calls = uploader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 1);
        assert_eq!(calls[0].1[0].flag, "flag-a");
    }

    #[tokio::test]
    async fn overlapping_drains_never_double_send() {
        let uploader = Arc::new(ScriptedUploader::always_ok());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::new(InMemoryStorage::new()) as _);

        {
            let mut state = outbox.lock_state();
            for i in 0..5 {
                state.push("token-1", &format!("flag-{i}"), time(i));
            }
        }

        tokio::join!(outbox.drain_once(), outbox.drain_once());

        let delivered: usize = uploader.calls().iter().map(|(_, flags)| flags.len()).sum();
        assert_eq!(delivered, 5, "each event must be delivered exactly once");
    }

    #[tokio::test]
    async fn storage_failures_do_not_block_delivery() {
        struct BrokenStorage;
        impl Storage for BrokenStorage {
            fn save(&self, _document: &serde_json::Value) -> Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
            }
            fn load(&self) -> Result<Option<serde_json::Value>> {
                Ok(None)
            }
            fn clear(&self) -> Result<()> {
                Ok(())
            }
        }

        let uploader = Arc::new(ScriptedUploader::always_ok());
        let outbox = ApplyOutbox::new(Arc::clone(&uploader), Arc::new(BrokenStorage) as _);

        outbox.record("flag-a", "token-1", time(0));
        outbox.drain_once().await;

        assert!(!uploader.calls().is_empty());
        assert_eq!(outbox.pending_event_count(), 0);
    }
}
