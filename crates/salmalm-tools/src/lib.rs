// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool execution layer: the [`Tool`] trait, the [`ToolRegistry`] enforcing
//! tier auth / path jails / audit, and the builtin tools (file I/O, exec,
//! python_eval).

mod builtin;
mod exec;
mod registry;
pub mod sanitize;
mod tool;

pub use builtin::{ListDirTool, ReadFileTool, WriteFileTool};
pub use exec::{ExecTool, PythonEvalTool};
pub use registry::{AuditSink, ToolRegistry, ToolSpec};
pub use tool::{AuthTier, Tool, ToolContext};
