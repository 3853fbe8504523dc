// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod audit;
mod bus;
mod context;
mod conversation;
mod error;
mod events;
mod gate;
mod orchestrator;
mod recovery;
mod session;
#[cfg(test)]
mod tests;
mod voice;

pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use bus::{EventBus, Subscription};
pub use context::{Memberships, UserContext};
pub use conversation::{ConversationLog, Message, Role, ToolCallRecord, ToolResultRecord};
pub use error::{OrchestratorError, Severity};
pub use events::{Event, EventKind};
pub use gate::{GateRequest, Operation, PermissionGate};
pub use orchestrator::Orchestrator;
pub use recovery::{RecoveryAction, RecoveryCoordinator};
pub use session::{Session, SessionManager, SessionMode, SessionStatus};
pub use voice::{NullSpeech, SpeechService};
