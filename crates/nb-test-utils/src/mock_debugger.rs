// mock_debugger: A scripted Node.js debugger for integration tests.
//
// Binds 127.0.0.1:0, speaks the Content-Length frame protocol, sends the
// connect banner, and answers commands from configurable state. Tests can
// inject asynchronous events (break, exception) and force mid-session EOF.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use nb_protocol::{Event, FrameCodec, ProtocolMessage, RefValue, Response, WireRequest};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

/// The header block a real Node debuggee sends on connect: several
/// informational headers and an empty body.
const CONNECT_BANNER: &[u8] = b"Type: connect\r\nV8-Version: 3.14.5.9\r\nProtocol-Version: 1\r\nEmbedding-Host: node v0.10.25\r\nContent-Length: 0\r\n\r\n";

/// Outcome configured for an `evaluate` expression.
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    Success { body: Value, refs: Vec<RefValue> },
    Failure { message: String },
}

#[derive(Debug, Default)]
struct MockState {
    scripts: Vec<(String, u8)>,
    next_bp: u32,
    requests: Vec<WireRequest>,
    frame_scopes: Vec<(u32, u8)>,
    scope_bodies: HashMap<u32, Value>,
    lookup_mirrors: HashMap<u64, Value>,
    lookup_refs: Vec<RefValue>,
    eval_outcomes: HashMap<String, EvalOutcome>,
    backtrace_frames: Vec<String>,
    /// Live connection handles, replaced on reconnect.
    inject: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    drop_conn: Option<watch::Sender<bool>>,
}

/// A mock debuggee for integration testing.
///
/// Each test spins up its own isolated instance on a random port.
pub struct MockDebugger {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl MockDebugger {
    /// Start the mock, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            // Connection errors are expected when clients drop.
                            let _ = handle_connection(stream, state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    // -- configuration --

    pub fn set_scripts(&self, scripts: &[(&str, u8)]) {
        self.state.lock().unwrap().scripts = scripts
            .iter()
            .map(|(n, t)| ((*n).to_owned(), *t))
            .collect();
    }

    /// Scope descriptors returned by `frame`, as `(index, kind)` pairs.
    pub fn set_frame_scopes(&self, scopes: &[(u32, u8)]) {
        self.state.lock().unwrap().frame_scopes = scopes.to_vec();
    }

    /// The full wire body returned for `scope` requests at `index`.
    pub fn set_scope_body(&self, index: u32, body: Value) {
        self.state.lock().unwrap().scope_bodies.insert(index, body);
    }

    /// A mirror returned by `lookup` for `handle`. Refs set separately.
    pub fn set_lookup_mirror(&self, handle: u64, mirror: Value) {
        self.state
            .lock()
            .unwrap()
            .lookup_mirrors
            .insert(handle, mirror);
    }

    pub fn set_lookup_refs(&self, refs: Vec<RefValue>) {
        self.state.lock().unwrap().lookup_refs = refs;
    }

    pub fn set_eval_outcome(&self, expression: &str, outcome: EvalOutcome) {
        self.state
            .lock()
            .unwrap()
            .eval_outcomes
            .insert(expression.to_owned(), outcome);
    }

    pub fn set_backtrace_frames(&self, frames: &[&str]) {
        self.state.lock().unwrap().backtrace_frames =
            frames.iter().map(|f| (*f).to_owned()).collect();
    }

    // -- interaction --

    /// Inject an asynchronous event into the live connection.
    pub fn send_event(&self, event: &str, body: Value) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.inject {
            let _ = tx.send(ProtocolMessage::Event(Event {
                event: event.to_owned(),
                body: Some(body),
            }));
        }
    }

    /// Force mid-session EOF on the live connection.
    pub fn drop_connection(&self) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.drop_conn {
            let _ = tx.send(true);
        }
    }

    /// Everything received so far, oldest first.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.command == command)
            .count()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<MockState>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.write_all(CONNECT_BANNER).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<ProtocolMessage>();
    let (drop_tx, mut drop_rx) = watch::channel(false);
    {
        let mut s = state.lock().unwrap();
        s.inject = Some(inject_tx);
        s.drop_conn = Some(drop_tx);
    }

    loop {
        tokio::select! {
            biased;
            _ = drop_rx.changed() => {
                if *drop_rx.borrow() {
                    break; // simulate abrupt EOF
                }
            }
            injected = inject_rx.recv() => {
                let Some(msg) = injected else { break };
                framed.send(msg).await?;
            }
            frame = framed.next() => {
                let Some(frame) = frame else { break };
                let msg = frame?;
                let ProtocolMessage::Request(req) = msg else { continue };
                let (resp, close) = respond(&state, &req);
                framed.send(ProtocolMessage::Response(resp)).await?;
                if close {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn ok(req: &WireRequest, body: Option<Value>, refs: Vec<RefValue>) -> Response {
    Response {
        request_seq: req.seq,
        command: req.command.clone(),
        success: true,
        body,
        refs,
        message: None,
        running: None,
    }
}

fn failure(req: &WireRequest, message: &str) -> Response {
    Response {
        request_seq: req.seq,
        command: req.command.clone(),
        success: false,
        body: None,
        refs: Vec::new(),
        message: Some(message.to_owned()),
        running: None,
    }
}

/// Build the response for one request and whether to close afterwards.
fn respond(state: &Arc<Mutex<MockState>>, req: &WireRequest) -> (Response, bool) {
    let mut s = state.lock().unwrap();
    s.requests.push(req.clone());
    let args = req.arguments.clone().unwrap_or(Value::Null);

    let resp = match req.command.as_str() {
        "scripts" => {
            let body: Vec<Value> = s
                .scripts
                .iter()
                .map(|(name, kind)| json!({"name": name, "type": kind}))
                .collect();
            ok(req, Some(Value::Array(body)), Vec::new())
        }
        "setbreakpoint" => {
            s.next_bp += 1;
            let target = args.get("target").and_then(Value::as_str).unwrap_or("");
            let line = args.get("line").and_then(Value::as_u64).unwrap_or(0);
            ok(
                req,
                Some(json!({
                    "breakpoint": s.next_bp,
                    "script_name": target,
                    "actual_locations": [{"line": line}],
                })),
                Vec::new(),
            )
        }
        "clearbreakpoint" | "changebreakpoint" | "setexceptionbreak" => ok(req, None, Vec::new()),
        "continue" => ok(req, None, Vec::new()),
        "frame" => {
            let scopes: Vec<Value> = s
                .frame_scopes
                .iter()
                .map(|(index, kind)| json!({"index": index, "type": kind}))
                .collect();
            ok(req, Some(json!({"index": 0, "scopes": scopes})), Vec::new())
        }
        "scope" => {
            let number = args.get("number").and_then(Value::as_u64).unwrap_or(0);
            match s.scope_bodies.get(&u32::try_from(number).unwrap_or(u32::MAX)) {
                Some(body) => ok(req, Some(body.clone()), Vec::new()),
                None => failure(req, "Unknown scope"),
            }
        }
        "lookup" => {
            let handles: Vec<u64> = args
                .get("handles")
                .and_then(Value::as_array)
                .map(|hs| hs.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            let mut body = serde_json::Map::new();
            for handle in handles {
                if let Some(mirror) = s.lookup_mirrors.get(&handle) {
                    body.insert(handle.to_string(), mirror.clone());
                }
            }
            ok(req, Some(Value::Object(body)), s.lookup_refs.clone())
        }
        "evaluate" => {
            let expression = args.get("expression").and_then(Value::as_str).unwrap_or("");
            match s.eval_outcomes.get(expression).cloned() {
                Some(EvalOutcome::Success { body, refs }) => ok(req, Some(body), refs),
                Some(EvalOutcome::Failure { message }) => failure(req, &message),
                None => ok(
                    req,
                    Some(json!({"handle": 0, "type": "undefined", "text": "undefined"})),
                    Vec::new(),
                ),
            }
        }
        "backtrace" => {
            let frames: Vec<Value> = s
                .backtrace_frames
                .iter()
                .map(|text| json!({"text": text}))
                .collect();
            ok(req, Some(json!({"frames": frames})), Vec::new())
        }
        "disconnect" => return (ok(req, None, Vec::new()), true),
        _ => failure(req, "Unknown command"),
    };
    (resp, false)
}
