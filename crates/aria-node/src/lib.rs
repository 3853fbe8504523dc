// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod auth;
mod error;
mod frames;
mod server;
mod ws;

pub use auth::{AuthProvider, BearerSecret, StaticTokenAuth, TokenDigest};
pub use error::NodeError;
pub use frames::{ClientFrame, ServerFrame};
pub use server::{router, serve, NodeState};
