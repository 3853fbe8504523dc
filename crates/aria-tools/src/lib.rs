// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod dispatcher;
mod registry;
mod tool;
mod validate;

pub use dispatcher::{
    Caller, DispatchError, DispatchOutcome, InvocationOutcome, InvocationRecord, ToolDispatcher,
};
pub use registry::ToolRegistry;
pub use tool::{FnTool, Tool, ToolCall, ToolOutput};
pub use validate::{scan_unsafe, validate_parameters};
