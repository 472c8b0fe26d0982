// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token refresh against the two upstream auth flavors: IdC device-grant
//! credentials and social-login refresh tokens, plus the device
//! authorization polling flow and machine-id handling.

mod client;
mod machine;

pub use client::{DeviceAuthorization, TokenClient, TokenRefresh};
pub use machine::{chat_user_agent, ensure_machine_id, is_valid_machine_id, user_agent};
