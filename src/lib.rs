// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod client;
pub mod error;
pub mod payload;
pub mod wire;

pub use client::Client;
pub use error::IpcError;
pub use payload::{BytesPayload, Serializable};
