//! A local cache of server-resolved flag values for one evaluation context.
//!
//! The cache holds exactly one resolution "generation" at a time: a set of entries sharing one
//! resolve token and one context fingerprint. A successful resolve replaces the whole generation
//! ([`ResolutionCache::clear_and_set`]); entries are only ever mutated in place for apply-status
//! transitions. Staleness is advisory: [`ResolutionCache::get`] reports whether the caller's
//! context still matches the cached generation, and the caller decides whether to re-resolve.
//!
//! All operations serialize through a single exclusive critical section. Entries are small and
//! operations brief, so atomicity of the generation swap and status transitions is worth more than
//! read parallelism here. Persistence is debounced: mutations signal a background task which
//! writes the latest snapshot after a quiet window, so bursts of mutation collapse into one write.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::context::EvaluationContext;
use crate::fingerprint::ContextFingerprint;
use crate::storage::Storage;
use crate::{Error, Result};

/// Delivery state of a cached flag's apply report.
///
/// Legal transitions: `NotApplied → Applying → {Applied | ApplyFailed}` and
/// `ApplyFailed → Applying` (retry). `Applied → Applying` is a caller bug: the report was already
/// delivered and must not be re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    /// The value has not been reported as used yet.
    NotApplied,
    /// An apply report is in flight.
    Applying,
    /// The apply report was delivered.
    Applied,
    /// The last apply report attempt failed; a retry is allowed.
    ApplyFailed,
}

impl ApplyStatus {
    fn can_become(self, next: ApplyStatus) -> bool {
        use ApplyStatus::*;
        matches!(
            (self, next),
            (NotApplied, Applying)
                | (Applying, Applied)
                | (Applying, ApplyFailed)
                | (ApplyFailed, Applying)
        )
    }
}

/// A flag value resolved by the server, before it enters the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedValue {
    /// Name of the flag.
    pub flag_name: String,
    /// Variant the context was assigned to, if any.
    #[serde(default)]
    pub variant: Option<String>,
    /// The resolved value.
    pub value: serde_json::Value,
}

impl From<crate::api::ResolvedFlag> for ResolvedValue {
    fn from(flag: crate::api::ResolvedFlag) -> ResolvedValue {
        ResolvedValue {
            flag_name: flag.flag,
            variant: flag.variant,
            value: flag.value,
        }
    }
}

/// A cached resolution for a single flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntry {
    pub flag_name: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub value: serde_json::Value,
    /// Token of the resolution that produced this entry.
    pub resolve_token: String,
    /// Fingerprint of the context the entry was resolved for.
    pub context_fingerprint: ContextFingerprint,
    pub apply_status: ApplyStatus,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFlag {
    pub entry: ResolvedEntry,
    /// True when the caller's context no longer matches the cached generation. The cached value is
    /// outdated though not yet proven wrong; triggering a fresh resolve is up to the caller.
    pub needs_update: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheState {
    resolve_token: String,
    context_fingerprint: ContextFingerprint,
    entries: HashMap<String, ResolvedEntry>,
}

/// Quiet window after a mutation before the snapshot is written out.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// In-memory store of the current resolution generation, persisted asynchronously through a
/// [`Storage`] collaborator.
///
/// Must be created inside a tokio runtime: construction spawns the debounced persistence task.
/// Persistence failures are logged and swallowed; the in-memory state stays authoritative.
pub struct ResolutionCache {
    state: Arc<Mutex<CacheState>>,
    storage: Arc<dyn Storage>,
    dirty: Arc<Notify>,
}

impl ResolutionCache {
    /// Create a cache backed by `storage`, restoring the previously persisted generation if one
    /// exists.
    pub fn new(storage: Arc<dyn Storage>) -> ResolutionCache {
        let state = Arc::new(Mutex::new(load_state(&*storage)));
        let dirty = Arc::new(Notify::new());
        spawn_persist_task(
            Arc::downgrade(&state),
            Arc::clone(&storage),
            Arc::clone(&dirty),
        );
        ResolutionCache {
            state,
            storage,
            dirty,
        }
    }

    /// Look up `flag` for `context`.
    ///
    /// Returns `None` if the flag is not cached. Otherwise the entry is returned together with a
    /// staleness indicator ([`CachedFlag::needs_update`]).
    ///
    /// # Errors
    ///
    /// - [`Error::TargetingKeyMissing`] if `context` carries no targeting key.
    pub fn get(&self, flag: &str, context: &EvaluationContext) -> Result<Option<CachedFlag>> {
        if context.targeting_key().is_none() {
            return Err(Error::TargetingKeyMissing);
        }
        let fingerprint = ContextFingerprint::of(context);

        let state = self.lock_state();
        Ok(state.entries.get(flag).map(|entry| CachedFlag {
            needs_update: entry.context_fingerprint != fingerprint,
            entry: entry.clone(),
        }))
    }

    /// Atomically replace the entire cache content with a new resolution generation.
    ///
    /// This is the only way entries enter the cache. All new entries start as
    /// [`ApplyStatus::NotApplied`].
    ///
    /// # Errors
    ///
    /// - [`Error::TargetingKeyMissing`] if `context` carries no targeting key.
    pub fn clear_and_set(
        &self,
        values: Vec<ResolvedValue>,
        context: &EvaluationContext,
        resolve_token: impl Into<String>,
    ) -> Result<()> {
        if context.targeting_key().is_none() {
            return Err(Error::TargetingKeyMissing);
        }
        let resolve_token = resolve_token.into();
        let fingerprint = ContextFingerprint::of(context);

        {
            let mut state = self.lock_state();
            state.entries = values
                .into_iter()
                .map(|value| {
                    (
                        value.flag_name.clone(),
                        ResolvedEntry {
                            flag_name: value.flag_name,
                            variant: value.variant,
                            value: value.value,
                            resolve_token: resolve_token.clone(),
                            context_fingerprint: fingerprint.clone(),
                            apply_status: ApplyStatus::NotApplied,
                        },
                    )
                })
                .collect();
            state.resolve_token = resolve_token;
            state.context_fingerprint = fingerprint;
        }
        self.dirty.notify_one();
        Ok(())
    }

    /// Transition the apply status of a cached flag.
    ///
    /// # Errors
    ///
    /// - [`Error::TargetingKeyMissing`] if `context` carries no targeting key.
    /// - [`Error::ContextStale`] if `resolve_token` does not match the current generation; the
    ///   caller's report belongs to a superseded resolution and must be discarded.
    /// - [`Error::FlagNotFound`] if the flag is not cached.
    /// - [`Error::IllegalApplyTransition`] if the state machine forbids the transition.
    pub fn update_apply_status(
        &self,
        flag: &str,
        context: &EvaluationContext,
        resolve_token: &str,
        status: ApplyStatus,
    ) -> Result<()> {
        if context.targeting_key().is_none() {
            return Err(Error::TargetingKeyMissing);
        }

        {
            let mut state = self.lock_state();
            if state.resolve_token != resolve_token {
                return Err(Error::ContextStale);
            }
            let entry = state.entries.get_mut(flag).ok_or(Error::FlagNotFound)?;
            if !entry.apply_status.can_become(status) {
                return Err(Error::IllegalApplyTransition {
                    from: entry.apply_status,
                    to: status,
                });
            }
            entry.apply_status = status;
        }
        self.dirty.notify_one();
        Ok(())
    }

    /// Wipe the cache, in memory and persisted. Used e.g. on credential change.
    pub fn clear(&self) {
        *self.lock_state() = CacheState::default();
        if let Err(err) = self.storage.clear() {
            log::warn!(target: "beacon", "failed to clear persisted resolution cache: {err}");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .expect("thread holding cache lock should not panic")
    }
}

fn load_state(storage: &dyn Storage) -> CacheState {
    match storage.load() {
        Ok(Some(document)) => match serde_json::from_value(document) {
            Ok(state) => state,
            Err(err) => {
                log::warn!(target: "beacon", "discarding unreadable resolution cache snapshot: {err}");
                CacheState::default()
            }
        },
        Ok(None) => CacheState::default(),
        Err(err) => {
            log::warn!(target: "beacon", "failed to load resolution cache snapshot: {err}");
            CacheState::default()
        }
    }
}

/// Debounced persistence: each wake-up waits out a quiet window, then writes the snapshot that is
/// current at that point. The snapshot is taken under the lock but written outside it.
fn spawn_persist_task(state: Weak<Mutex<CacheState>>, storage: Arc<dyn Storage>, dirty: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            dirty.notified().await;
            tokio::time::sleep(PERSIST_DEBOUNCE).await;

            // The cache owning the state has been dropped; nothing left to persist.
            let Some(state) = state.upgrade() else { break };
            let document = {
                let state = state
                    .lock()
                    .expect("thread holding cache lock should not panic");
                serde_json::to_value(&*state)
            };
            match document {
                Ok(document) => {
                    if let Err(err) = storage.save(&document) {
                        log::warn!(target: "beacon", "failed to persist resolution cache: {err}");
                    }
                }
                Err(err) => {
                    log::warn!(target: "beacon", "failed to encode resolution cache snapshot: {err}");
                }
            }
        }
    });
}
