//! The session controller.
//!
//! One long-lived task owns all mirrored debugger state (breakpoint catalog,
//! script catalog, variable model) and the transport handle. It multiplexes
//! three inputs: editor command lines, decoded link events, and a periodic
//! tick that polls `scripts` and retires timed-out requests. Everything the
//! editor sees flows out through the `Console`/`FrameView`/`VarView` sinks.
//!
//! State machine:
//!
//! ```text
//! Disconnected --attach-->   Connecting
//! Connecting   --ok-->       Running
//! Connecting   --refused-->  Disconnected
//! Running      --break/exc-->Paused
//! Paused       --resume-->   Running
//! any          --close-->    Disconnected
//! ```

use crate::BridgeConfig;
use crate::breakpoints::{BreakpointCatalog, InsertOutcome};
use crate::dispatcher::RequestDispatcher;
use crate::editor::{Console, FrameView, UserCommand, VarView, parse_command};
use crate::scripts::{ScriptCatalog, ScriptInfo};
use crate::transport::{DebuggerLink, LinkEvent, inbound_queue};
use crate::varmodel::{FoldAction, ScopeDescriptor, VarModel};
use nb_protocol::{
    CommandTag, Event, InlineProperty, ProtocolMessage, RefValue, Response, StepAction, commands,
    join_properties, render_evaluate,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Running,
    Paused,
}

/// Internal failure while handling an inbound message. Caught at the
/// dispatch boundary and reported on the console; never aborts the session.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("malformed body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    Missing(&'static str),
}

/// Context remembered against a request's `seq` where the response alone is
/// not enough to update the mirror.
#[derive(Debug, Clone)]
enum PendingOp {
    SetBreakpoint { name: String, line: u32 },
    ChangeBreakpoint { bp_id: u32, enabled: bool },
}

pub struct Session<C, F, V> {
    config: BridgeConfig,
    console: C,
    frame_view: F,
    var_view: V,
    state: SessionState,
    breakpoints: BreakpointCatalog,
    scripts: ScriptCatalog,
    vars: VarModel,
    dispatcher: RequestDispatcher,
    link: Option<DebuggerLink>,
    link_events: Option<mpsc::Receiver<LinkEvent>>,
    /// Resume actions withheld while standby breakpoints exist.
    resume_queue: VecDeque<Option<StepAction>>,
    pending_ops: HashMap<u32, PendingOp>,
    /// Refetch `frame` on the next tick (recovery pacing).
    refetch_frame: bool,
    expect_close: bool,
    transport_failed: bool,
    quit: bool,
}

impl<C: Console, F: FrameView, V: VarView> Session<C, F, V> {
    pub fn new(config: BridgeConfig, console: C, frame_view: F, var_view: V) -> Self {
        Self {
            config,
            console,
            frame_view,
            var_view,
            state: SessionState::Disconnected,
            breakpoints: BreakpointCatalog::new(),
            scripts: ScriptCatalog::new(),
            vars: VarModel::new(),
            dispatcher: RequestDispatcher::new(),
            link: None,
            link_events: None,
            resume_queue: VecDeque::new(),
            pending_ops: HashMap::new(),
            refetch_frame: false,
            expect_close: false,
            transport_failed: false,
            quit: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until `quit` or the command stream ends. Returns
    /// the process exit code.
    pub async fn run(mut self, mut command_lines: mpsc::Receiver<String>) -> i32 {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            // Resolve one input first; the borrow on the link receiver must
            // end before the handlers touch the rest of the session.
            let input = tokio::select! {
                biased;
                line = command_lines.recv() => Input::Line(line),
                event = next_link_event(&mut self.link_events) => Input::Link(event),
                _ = tick.tick() => Input::Tick,
            };
            match input {
                Input::Line(None) => break,
                Input::Line(Some(line)) => {
                    self.handle_line(&line).await;
                    if self.quit {
                        break;
                    }
                }
                Input::Link(Some(event)) => self.handle_link_event(event).await,
                Input::Link(None) => self.link_events = None,
                Input::Tick => self.on_tick().await,
            }
        }
        if self.quit || !self.transport_failed { 0 } else { 1 }
    }

    // -----------------------------------------------------------------------
    // Editor commands
    // -----------------------------------------------------------------------

    pub async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        // Echo the command before executing it.
        self.console.print(&format!("{line}\n"));
        let cmd = parse_command(line);
        self.handle_command(cmd).await;
    }

    async fn handle_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::Attach => self.attach().await,
            UserCommand::Dettach => {
                if self.link.is_none() {
                    self.console.print("The inferior progam was not attached.\n");
                } else {
                    self.expect_close = true;
                    self.send(commands::disconnect()).await;
                }
            }
            UserCommand::Break { name, line } => {
                match self.breakpoints.add_standby(&name, line) {
                    InsertOutcome::Added(bp_id) => {
                        debug!(bp_id, name = %name, line, "standby breakpoint added");
                    }
                    InsertOutcome::Duplicate => {}
                }
                // The next scripts response decides whether it can be set.
                self.send(commands::scripts()).await;
            }
            UserCommand::Clear { name, line } => match self.breakpoints.remove(&name, line) {
                Some(bp) => {
                    if !bp.standby {
                        self.send(commands::clear_breakpoint(bp.bp_id)).await;
                    }
                    self.console.print(&format!(
                        "Clear Breakpoint {} at file {name}, line {line}.\n",
                        bp.bp_id
                    ));
                }
                None => self.console.print("Invalid arguments.\n"),
            },
            UserCommand::Disable { bp_id } => self.change_bp_state(bp_id, false).await,
            UserCommand::Enable { bp_id } => self.change_bp_state(bp_id, true).await,
            UserCommand::Continue => self.request_resume(None).await,
            UserCommand::Step => self.request_resume(Some(StepAction::Next)).await,
            UserCommand::StepIn => self.request_resume(Some(StepAction::In)).await,
            UserCommand::StepOut => self.request_resume(Some(StepAction::Out)).await,
            UserCommand::Print { expression } => {
                if self.link.is_none() {
                    self.console.print("The inferior progam was not attached.\n");
                } else {
                    self.send(commands::evaluate(&expression, Some(0))).await;
                }
            }
            UserCommand::Backtrace => match self.state {
                SessionState::Paused => {
                    self.send(commands::backtrace()).await;
                }
                SessionState::Running | SessionState::Connecting => {}
                SessionState::Disconnected => {
                    self.console.print("The inferior progam was not attached.\n");
                }
            },
            UserCommand::FoldVar { line } => match self.vars.toggle_fold(line) {
                FoldAction::Redraw => {
                    let text = self.vars.render();
                    self.var_view.update(&text, true);
                }
                FoldAction::Lookup(handle) => {
                    self.send(commands::lookup(&[handle])).await;
                }
                FoldAction::OutOfRange => self.console.print("Invalid arguments.\n"),
            },
            UserCommand::Quit => {
                if self.link.is_some() {
                    self.expect_close = true;
                    self.send(commands::disconnect()).await;
                    if let Some(link) = &self.link {
                        link.close();
                    }
                }
                self.console.print("Netbeans connection closed.\n");
                self.quit = true;
            }
            UserCommand::SigInt | UserCommand::SymCompletion => {
                self.console.print("Not implemented.\n");
            }
            UserCommand::InvalidArguments => self.console.print("Invalid arguments.\n"),
            UserCommand::NotALineNumber => self.console.print("Not a line number.\n"),
            UserCommand::Ignored => self.console.print("Command ignored.\n"),
        }
    }

    async fn attach(&mut self) {
        if self.link.is_some() {
            self.console.print("The inferior progam was attached.\n");
            return;
        }
        self.state = SessionState::Connecting;
        let (tx, rx) = inbound_queue();
        match DebuggerLink::connect(&self.config.host, self.config.port, tx).await {
            Ok(link) => {
                info!(host = %self.config.host, port = self.config.port, "attached");
                self.link = Some(link);
                self.link_events = Some(rx);
                self.state = SessionState::Running;
                self.transport_failed = false;
                self.expect_close = false;
                // Prime the script catalog; standby breakpoints from a
                // previous connection re-promote from the response.
                self.send(commands::scripts()).await;
            }
            Err(e) => {
                debug!(error = %e, "connect failed");
                self.state = SessionState::Disconnected;
                self.transport_failed = true;
                self.console.print("Node.js debugger connection closed.\n");
            }
        }
    }

    async fn change_bp_state(&mut self, bp_id: u32, enabled: bool) {
        if self.breakpoints.find_by_id(bp_id).is_none() {
            self.console.print(&format!("\"{bp_id}\" not found.\n"));
            return;
        }
        let cmd = commands::change_breakpoint(bp_id, enabled, None, 0);
        if let Some(seq) = self.send(cmd).await {
            self.pending_ops
                .insert(seq, PendingOp::ChangeBreakpoint { bp_id, enabled });
        }
    }

    /// Resume (continue or step). Withheld while any standby breakpoint
    /// exists so the debuggee cannot run past a location the server has not
    /// been told about yet.
    async fn request_resume(&mut self, step: Option<StepAction>) {
        if self.link.is_none() {
            self.console.print("The inferior progam was not attached.\n");
            return;
        }
        self.frame_view.hide();
        if self.breakpoints.has_standby() {
            self.resume_queue.push_back(step);
            self.send(commands::scripts()).await;
        } else {
            self.send_resume(step).await;
        }
    }

    async fn send_resume(&mut self, step: Option<StepAction>) {
        self.send(commands::resume(step, 1)).await;
        self.state = SessionState::Running;
    }

    // -----------------------------------------------------------------------
    // Link events
    // -----------------------------------------------------------------------

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Closed => {
                if !self.expect_close {
                    self.transport_failed = true;
                }
                self.do_close();
            }
            LinkEvent::Message(msg) => {
                if let Err(e) = self.handle_message(msg).await {
                    // Inner failures must never take the session down.
                    warn!(error = %e, "response handling failed");
                    self.console
                        .print(&format!("\nException in response handling.\n{e}\n"));
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ProtocolMessage) -> Result<(), HandleError> {
        match msg {
            ProtocolMessage::Event(event) => self.handle_event(event).await,
            ProtocolMessage::Response(resp) => self.handle_response(resp).await,
            ProtocolMessage::Request(req) => {
                warn!(command = %req.command, "unexpected request from debuggee");
                Ok(())
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), HandleError> {
        match event.event.as_str() {
            "break" => {
                let body = event.body.ok_or(HandleError::Missing("break body"))?;
                self.on_stop(&body).await?;
            }
            "exception" => {
                let body = event.body.ok_or(HandleError::Missing("exception body"))?;
                self.on_stop(&body).await?;
                let text = body
                    .pointer("/exception/text")
                    .and_then(Value::as_str)
                    .unwrap_or("uncaught exception");
                self.console.print(&format!("{text}\n"));
            }
            other => debug!(event = other, "ignoring event"),
        }
        Ok(())
    }

    /// Common handling for `break` and `exception` stops: move the frame
    /// indicator and start the frame/scope/lookup round-trips.
    async fn on_stop(&mut self, body: &Value) -> Result<(), HandleError> {
        let name = body
            .pointer("/script/name")
            .and_then(Value::as_str)
            .ok_or(HandleError::Missing("script.name"))?
            .to_owned();
        let source_line = body
            .get("sourceLine")
            .and_then(Value::as_u64)
            .and_then(|l| u32::try_from(l).ok())
            .ok_or(HandleError::Missing("sourceLine"))?;
        let line = source_line + 1;
        self.state = SessionState::Paused;
        self.send(commands::frame()).await;
        // Only absolute paths can be jumped to in the editor.
        if std::path::Path::new(&name).is_absolute() {
            self.frame_view.show(&name, line);
        } else {
            self.console.print(&format!("Break in {name}.\n"));
        }
        Ok(())
    }

    async fn handle_response(&mut self, resp: Response) -> Result<(), HandleError> {
        let Some(tag) = self.dispatcher.complete(resp.request_seq) else {
            debug!(
                request_seq = resp.request_seq,
                command = %resp.command,
                "response for unknown seq"
            );
            return Ok(());
        };
        match tag {
            CommandTag::Disconnect => self.do_close(),
            CommandTag::Scripts => self.on_scripts(resp).await?,
            CommandTag::SetBreakpoint => self.on_set_breakpoint(&resp)?,
            CommandTag::ClearBreakpoint | CommandTag::SetExceptionBreak => {
                if !resp.success {
                    self.print_failure(&resp);
                }
            }
            CommandTag::ChangeBreakpoint => {
                let op = self.pending_ops.remove(&resp.request_seq);
                if resp.success {
                    if let Some(PendingOp::ChangeBreakpoint { bp_id, enabled }) = op {
                        self.breakpoints.set_enabled_by_id(bp_id, enabled);
                    }
                } else {
                    self.print_failure(&resp);
                }
            }
            CommandTag::Continue => {
                if resp.success {
                    self.state = SessionState::Running;
                } else {
                    self.print_failure(&resp);
                }
            }
            CommandTag::Evaluate => self.on_evaluate(resp)?,
            CommandTag::Backtrace => self.on_backtrace(&resp)?,
            CommandTag::Frame => self.on_frame(resp).await?,
            CommandTag::Scope => self.on_scope(resp).await?,
            CommandTag::Lookup => self.on_lookup(resp)?,
        }
        Ok(())
    }

    async fn on_scripts(&mut self, resp: Response) -> Result<(), HandleError> {
        if !resp.success {
            self.print_failure(&resp);
            return Ok(());
        }
        let body = resp.body.ok_or(HandleError::Missing("scripts body"))?;
        let entries: Vec<ScriptInfo> = serde_json::from_value(body)?;
        self.scripts.replace_all(&entries);

        for candidate in self.breakpoints.standby_ready(&self.scripts) {
            self.breakpoints
                .clear_standby(&candidate.name, candidate.line);
            let bp = self.breakpoints.get(&candidate.name, candidate.line).cloned();
            let (enabled, condition, ignore_count) = bp
                .map(|bp| (bp.enabled, bp.condition, bp.ignore_count))
                .unwrap_or((true, None, 0));
            let cmd = commands::set_breakpoint(
                &candidate.name,
                candidate.line,
                enabled,
                condition.as_deref(),
                ignore_count,
            );
            if let Some(seq) = self.send(cmd).await {
                self.pending_ops.insert(
                    seq,
                    PendingOp::SetBreakpoint {
                        name: candidate.name,
                        line: candidate.line,
                    },
                );
            }
        }

        // Once the catalog is coherent, release withheld resume actions.
        // Promotion requests were queued first, so the server processes
        // them before the resume.
        if !self.breakpoints.has_standby() {
            while let Some(step) = self.resume_queue.pop_front() {
                self.send_resume(step).await;
            }
        }
        Ok(())
    }

    fn on_set_breakpoint(&mut self, resp: &Response) -> Result<(), HandleError> {
        let op = self.pending_ops.remove(&resp.request_seq);
        if !resp.success {
            self.print_failure(resp);
            return Ok(());
        }
        let body = resp
            .body
            .as_ref()
            .ok_or(HandleError::Missing("setbreakpoint body"))?;
        let server_id = body
            .get("breakpoint")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or(HandleError::Missing("breakpoint"))?;
        let script_name = body
            .get("script_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let actual_line = body
            .pointer("/actual_locations/0/line")
            .and_then(Value::as_u64)
            .and_then(|l| u32::try_from(l).ok())
            .ok_or(HandleError::Missing("actual_locations"))?
            + 1;
        if let Some(PendingOp::SetBreakpoint { name, line }) = op {
            self.breakpoints
                .acknowledge(&name, line, actual_line, server_id);
        }
        self.console.print(&format!(
            "Breakpoint {server_id} at file {script_name}, line {actual_line}.\n"
        ));
        Ok(())
    }

    fn on_evaluate(&mut self, resp: Response) -> Result<(), HandleError> {
        if !resp.success {
            self.print_failure(&resp);
            return Ok(());
        }
        let body = resp.body.ok_or(HandleError::Missing("evaluate body"))?;
        let mirror: RefValue = serde_json::from_value(body)?;
        let text = render_evaluate(&mirror, &resp.refs);
        self.console.print(&format!("{text}\n"));
        Ok(())
    }

    fn on_backtrace(&mut self, resp: &Response) -> Result<(), HandleError> {
        if !resp.success {
            self.print_failure(resp);
            return Ok(());
        }
        let frames = resp
            .body
            .as_ref()
            .and_then(|b| b.get("frames"))
            .and_then(Value::as_array)
            .ok_or(HandleError::Missing("frames"))?;
        let mut text = String::from("\n");
        for frame in frames {
            if let Some(t) = frame.get("text").and_then(Value::as_str) {
                text.push_str(t);
                text.push('\n');
            }
        }
        self.console.print(&format!("{text}\n"));
        Ok(())
    }

    async fn on_frame(&mut self, resp: Response) -> Result<(), HandleError> {
        let scopes = resp.body.as_ref().and_then(|b| b.get("scopes")).cloned();
        match (resp.success, scopes) {
            (true, Some(scopes)) => {
                let descriptors: Vec<ScopeDescriptor> = serde_json::from_value(scopes)?;
                self.vars.set_scopes(&descriptors);
                for d in &descriptors {
                    self.send(commands::scope(d.index)).await;
                }
            }
            _ => {
                // Stale or failed frame; retry on the next tick while still
                // paused so a coherent stop rebuilds the view.
                self.refetch_frame = true;
            }
        }
        Ok(())
    }

    async fn on_scope(&mut self, resp: Response) -> Result<(), HandleError> {
        if !resp.success || resp.body.is_none() {
            // The scope vanished between the frame and scope requests. Put
            // the previous tree back so a half-built one is never shown.
            self.vars.restore_prev_scopes();
            self.refetch_frame = true;
            return Ok(());
        }
        let body = resp.body.ok_or(HandleError::Missing("scope body"))?;
        let index = body
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or(HandleError::Missing("scope index"))?;
        let slots = body
            .pointer("/object/properties")
            .cloned()
            .ok_or(HandleError::Missing("object.properties"))?;
        let props: Vec<InlineProperty> = serde_json::from_value(slots)?;
        self.vars.set_scope_properties(index, props);
        if !self.vars.is_standby() {
            let handles = self.vars.lookup_list();
            if !handles.is_empty() {
                self.send(commands::lookup(&handles)).await;
            }
            self.push_var_view();
        }
        Ok(())
    }

    fn on_lookup(&mut self, resp: Response) -> Result<(), HandleError> {
        if !resp.success {
            self.print_failure(&resp);
            return Ok(());
        }
        let body = resp.body.ok_or(HandleError::Missing("lookup body"))?;
        let mirrors: HashMap<String, RefValue> = serde_json::from_value(body)?;
        for mirror in mirrors.into_values() {
            let props = join_properties(mirror.properties.as_deref().unwrap_or_default(), &resp.refs);
            if !self.vars.set_properties_for_handle(mirror.handle, props) {
                debug!(handle = mirror.handle, "lookup result for unknown handle");
            }
        }
        if !self.vars.is_standby() {
            self.push_var_view();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn on_tick(&mut self) {
        if self.link.is_none() {
            return;
        }
        self.send(commands::scripts()).await;
        if self.refetch_frame && self.state == SessionState::Paused {
            self.refetch_frame = false;
            self.send(commands::frame()).await;
        }
        for timed_out in self.dispatcher.sweep(self.config.request_timeout) {
            warn!(seq = timed_out.seq, command = timed_out.name, "request timed out");
            self.console
                .print(&format!("Request '{}' timed out.\n", timed_out.name));
            self.pending_ops.remove(&timed_out.seq);
        }
    }

    async fn send(&mut self, cmd: nb_protocol::Command) -> Option<u32> {
        let link = self.link.as_ref()?;
        let req = self.dispatcher.make_request(cmd);
        let seq = req.seq;
        if link.send(req).await.is_err() {
            // The link died under us; the reader's Closed event follows.
            self.dispatcher.forget(seq);
            return None;
        }
        Some(seq)
    }

    fn push_var_view(&mut self) {
        let dirty = self.vars.dirty();
        let text = self.vars.render();
        self.var_view.update(&text, dirty);
    }

    fn print_failure(&mut self, resp: &Response) {
        let message = resp.message.as_deref().unwrap_or("command failed");
        self.console.print(&format!("{message}\n"));
    }

    /// Reset per-session state and detach. Idempotent: the `disconnect`
    /// response and the transport's final `Closed` may both arrive.
    fn do_close(&mut self) {
        if self.link.is_none() && self.state == SessionState::Disconnected {
            return;
        }
        self.console.print("Node.js debugger connection closed.\n");
        self.frame_view.hide();
        self.breakpoints.standby_all();
        self.scripts.clear();
        self.vars.reset();
        self.dispatcher.clear();
        self.pending_ops.clear();
        self.resume_queue.clear();
        self.refetch_frame = false;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;
        self.state = SessionState::Disconnected;
    }
}

/// One multiplexed controller input.
enum Input {
    Line(Option<String>),
    Link(Option<LinkEvent>),
    Tick,
}

async fn next_link_event(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
