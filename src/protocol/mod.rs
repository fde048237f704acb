// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framed request/response protocol to the local agentcore supervisor.

pub mod client;
pub mod common;
pub mod package;

pub use client::{ProtocolClient, ProtocolError, PushMessage, SharedClient};
pub use package::Package;
