// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Account state for the qrelay gateway: the credential data model, the
//! persistent-store collaborator interface, the in-memory selection pool,
//! and the single-flight refresh deduplicator.

mod account;
mod pool;
mod singleflight;
mod store;

pub use account::{Account, AccountStatus, AuthKind};
pub use pool::AccountPool;
pub use singleflight::{RefreshOutcome, SingleFlight};
pub use store::{AccountStatusSink, AccountStore, JsonFileStore, MemoryStore};
