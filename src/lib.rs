//! `beacon_core` is a common library to build Beacon SDKs for different host environments. If
//! you're a Beacon user, you probably want to take a look at one of the existing SDKs.
//!
//! # Overview
//!
//! Flag targeting rules run server-side. What this library provides is everything around that
//! remote resolution: a local cache of resolved values, staleness detection, and reliable
//! reporting of which flags were actually used.
//!
//! [`ResolutionCache`](resolution_cache::ResolutionCache) holds the current resolution
//! "generation": the set of flag values last resolved for one evaluation context, identified by a
//! resolve token and a [`ContextFingerprint`]. Lookups report whether the caller's
//! [`EvaluationContext`] still matches the cached generation; replacing the generation is always a
//! wholesale swap. Each entry tracks an apply status with a strict state machine, so a flag's
//! usage is reported exactly once per resolution.
//!
//! [`ApplyOutbox`](apply_outbox::ApplyOutbox) is a durable delivery queue for apply events.
//! Events are deduplicated per `(resolve token, flag)`, persisted before `record` returns,
//! batched, and drained against the apply endpoint with crash-safe status tracking: an event
//! found in-flight after a restart is simply sent again. Delivery is at-least-once.
//!
//! [`TransportClient`](transport::TransportClient) is the HTTP client both of them sit on top of.
//! It retries server-class failures and timeouts according to a [`RetryPolicy`] and decodes the
//! service's structured error bodies.
//!
//! Both stateful components persist through the [`Storage`](storage::Storage) collaborator — an
//! opaque single-document blob store. Persistence is best-effort by design: a failed write is
//! logged and the in-memory state stays authoritative until the next successful persist.
//!
//! Most SDKs are built from a `ResolutionCache`, an `ApplyOutbox`, and a `TransportClient`
//! wrapped into a host-language provider.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod apply_outbox;
pub mod resolution_cache;
pub mod storage;
pub mod timestamp;
pub mod transport;

mod context;
mod error;
mod fingerprint;
mod retry;

pub use context::{ContextValue, EvaluationContext};
pub use error::{Error, Result};
pub use fingerprint::ContextFingerprint;
pub use retry::RetryPolicy;
