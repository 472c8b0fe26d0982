// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Machine identifiers and the User-Agent strings derived from them.
//!
//! Each account pins one 64-hex device id for User-Agent continuity across
//! refreshes and chat calls.  An id that does not pass validation is
//! regenerated from 32 bytes of OS entropy; the caller is responsible for
//! persisting the replacement.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// IDE version baked into the User-Agent.
const KIRO_VERSION: &str = "0.2.13";

/// Exactly 64 lowercase hex characters.
pub fn is_valid_machine_id(id: &str) -> bool {
    id.len() == 64
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Return a valid machine id, regenerating when `current` fails validation.
/// The second tuple element reports whether a new id was generated.
pub fn ensure_machine_id(current: &str) -> (String, bool) {
    if is_valid_machine_id(current) {
        return (current.to_string(), false);
    }
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    (hex::encode(digest), true)
}

/// User-Agent for token and quota calls.
pub fn user_agent(machine_id: &str) -> String {
    format!("KiroIDE-{KIRO_VERSION}-{machine_id}")
}

/// User-Agent for the chat endpoint (SDK-prefixed variant).
pub fn chat_user_agent(machine_id: &str) -> String {
    format!("aws-sdk-js/1.0.7 KiroIDE-{KIRO_VERSION}-{machine_id}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
