// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod editor;
mod finish;
mod flush;
mod registry;
mod schema;
mod spec;
pub mod terminal;
mod tool;
mod workspace;

pub use editor::FileEditorTool;
pub use finish::{FinishTool, FINISH_TOOL_NAME};
pub use flush::{FlushSink, PeriodicFlusher};
pub use registry::{register_builtin_tools, register_tool, registered_tool_names, resolve_tool};
pub use schema::to_mcp_schema;
pub use spec::ToolSpec;
pub use tool::{ObservationPart, Tool, ToolCall, ToolContext, ToolError, ToolOutput};
pub use workspace::{CommandResult, LocalWorkspace, RemoteWorkspace, Workspace, WorkspaceSpec};
