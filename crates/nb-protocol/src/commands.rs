//! Translation from domain operations to V8 debugger command payloads.
//!
//! Line numbers are 1-based in the domain and 0-based on the wire; the
//! builders here perform the conversion, nothing else does.

use serde_json::{Value, json};

/// Domain tag stored by the dispatcher against the request's `seq` so the
/// matching response can be routed without re-parsing the command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    SetBreakpoint,
    ClearBreakpoint,
    ChangeBreakpoint,
    Continue,
    Evaluate,
    Scripts,
    Backtrace,
    Frame,
    Scope,
    Lookup,
    SetExceptionBreak,
    Disconnect,
}

/// Step granularity for `continue` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    In,
    Out,
    Next,
}

impl StepAction {
    fn wire_name(self) -> &'static str {
        match self {
            StepAction::In => "in",
            StepAction::Out => "out",
            StepAction::Next => "next",
        }
    }
}

/// Exception-break class for `setexceptionbreak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionBreakKind {
    All,
    Uncaught,
}

/// A translated command, ready for the dispatcher to wrap in a
/// [`crate::WireRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub tag: CommandTag,
    pub name: &'static str,
    pub arguments: Option<Value>,
}

pub fn set_breakpoint(
    target: &str,
    line: u32,
    enabled: bool,
    condition: Option<&str>,
    ignore_count: u32,
) -> Command {
    Command {
        tag: CommandTag::SetBreakpoint,
        name: "setbreakpoint",
        arguments: Some(json!({
            "type": "script",
            "target": target,
            "line": line.saturating_sub(1),
            "column": 0,
            "enabled": enabled,
            "condition": condition,
            "ignoreCount": ignore_count,
        })),
    }
}

pub fn clear_breakpoint(bp_id: u32) -> Command {
    Command {
        tag: CommandTag::ClearBreakpoint,
        name: "clearbreakpoint",
        arguments: Some(json!({ "breakpoint": bp_id })),
    }
}

pub fn change_breakpoint(
    bp_id: u32,
    enabled: bool,
    condition: Option<&str>,
    ignore_count: u32,
) -> Command {
    Command {
        tag: CommandTag::ChangeBreakpoint,
        name: "changebreakpoint",
        arguments: Some(json!({
            "breakpoint": bp_id,
            "enabled": enabled,
            "condition": condition,
            "ignoreCount": ignore_count,
        })),
    }
}

/// Plain `continue` sends no arguments object at all; steps send
/// `stepaction` + `stepcount`.
pub fn resume(step: Option<StepAction>, count: u32) -> Command {
    Command {
        tag: CommandTag::Continue,
        name: "continue",
        arguments: step.map(|s| {
            json!({
                "stepaction": s.wire_name(),
                "stepcount": count,
            })
        }),
    }
}

pub fn evaluate(expression: &str, frame: Option<u32>) -> Command {
    Command {
        tag: CommandTag::Evaluate,
        name: "evaluate",
        arguments: Some(json!({
            "expression": expression,
            "frame": frame,
            "global": frame.is_none(),
            "disable_break": true,
            "maxStringLength": 100_000,
        })),
    }
}

pub fn scripts() -> Command {
    Command {
        tag: CommandTag::Scripts,
        name: "scripts",
        arguments: None,
    }
}

pub fn backtrace() -> Command {
    Command {
        tag: CommandTag::Backtrace,
        name: "backtrace",
        arguments: None,
    }
}

pub fn frame() -> Command {
    Command {
        tag: CommandTag::Frame,
        name: "frame",
        arguments: None,
    }
}

pub fn scope(index: u32) -> Command {
    Command {
        tag: CommandTag::Scope,
        name: "scope",
        arguments: Some(json!({ "number": index })),
    }
}

pub fn lookup(handles: &[u64]) -> Command {
    Command {
        tag: CommandTag::Lookup,
        name: "lookup",
        arguments: Some(json!({ "handles": handles })),
    }
}

pub fn set_exception_break(kind: ExceptionBreakKind, enabled: bool) -> Command {
    let kind = match kind {
        ExceptionBreakKind::All => "all",
        ExceptionBreakKind::Uncaught => "uncaught",
    };
    Command {
        tag: CommandTag::SetExceptionBreak,
        name: "setexceptionbreak",
        arguments: Some(json!({ "type": kind, "enabled": enabled })),
    }
}

pub fn disconnect() -> Command {
    Command {
        tag: CommandTag::Disconnect,
        name: "disconnect",
        arguments: None,
    }
}
