//! Stop handling end to end: break events drive the frame/scope/lookup
//! round-trips, the variable view renders with change markers, folds expand
//! objects, and evaluate/backtrace results land on the console.

use bridge::{BridgeConfig, Console, FrameView, Session, VarView};
use nb_test_utils::{EvalOutcome, MockDebugger};
use nb_protocol::RefValue;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

#[derive(Clone, Default)]
struct TestConsole(Arc<Mutex<String>>);
impl Console for TestConsole {
    fn print(&mut self, text: &str) {
        self.0.lock().unwrap().push_str(text);
    }
}

#[derive(Clone, Default)]
struct TestFrameView(Arc<Mutex<Vec<Option<(String, u32)>>>>);
impl FrameView for TestFrameView {
    fn show(&mut self, file: &str, line: u32) {
        self.0.lock().unwrap().push(Some((file.to_owned(), line)));
    }
    fn hide(&mut self) {
        self.0.lock().unwrap().push(None);
    }
}

#[derive(Clone, Default)]
struct TestVarView(Arc<Mutex<Vec<String>>>);
impl VarView for TestVarView {
    fn update(&mut self, text: &str, _dirty: bool) {
        self.0.lock().unwrap().push(text.to_owned());
    }
}

struct Harness {
    server: MockDebugger,
    lines: mpsc::Sender<String>,
    console: TestConsole,
    frames: TestFrameView,
    vars: TestVarView,
}

impl Harness {
    async fn start() -> Self {
        let server = MockDebugger::start().await.unwrap();
        let config = BridgeConfig {
            host: "127.0.0.1".to_owned(),
            port: server.port(),
            tick: Duration::from_millis(20),
            ..BridgeConfig::default()
        };
        let console = TestConsole::default();
        let frames = TestFrameView::default();
        let vars = TestVarView::default();
        let session = Session::new(config, console.clone(), frames.clone(), vars.clone());
        let (lines, rx) = mpsc::channel(16);
        tokio::spawn(session.run(rx));
        Self {
            server,
            lines,
            console,
            frames,
            vars,
        }
    }

    async fn send(&self, line: &str) {
        self.lines.send(line.to_owned()).await.unwrap();
    }

    fn console_text(&self) -> String {
        self.console.0.lock().unwrap().clone()
    }

    fn last_render(&self) -> Option<String> {
        self.vars.0.lock().unwrap().last().cloned()
    }

    async fn wait_for(&self, what: &str, cond: impl Fn(&Self) -> bool) {
        timeout(Duration::from_secs(5), async {
            loop {
                if cond(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    /// Wait until the session's first `scripts` poll proves the connection
    /// (and the mock's event channel) is up.
    async fn wait_attached(&self) {
        self.wait_for("attach", |h| h.server.count_requests("scripts") >= 1)
            .await;
    }

    fn break_at(&self, name: &str, source_line: u64) {
        self.server.send_event(
            "break",
            json!({"script": {"name": name}, "sourceLine": source_line}),
        );
    }
}

fn scope_with_number(name: &str, value: i64, handle: u64) -> serde_json::Value {
    json!({
        "index": 0,
        "object": {
            "properties": [
                {"name": name, "value": {"type": "number", "value": value, "ref": handle}},
            ],
        },
    })
}

#[tokio::test]
async fn break_event_builds_and_renders_the_local_scope() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(0, scope_with_number("x", 1, 100));
    h.send("attach").await;
    h.wait_attached().await;

    h.break_at("app.js", 9);
    h.wait_for("render", |h| {
        h.last_render().is_some_and(|r| r.contains("x ={=} 1"))
    })
    .await;

    let render = h.last_render().unwrap();
    assert!(render.starts_with("[-] Local\n"), "render: {render:?}");
    // Relative script names cannot be jumped to.
    assert!(h.console_text().contains("Break in app.js.\n"));
}

#[tokio::test]
async fn break_with_absolute_path_moves_the_frame_sign() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(0, scope_with_number("x", 1, 100));
    h.send("attach").await;
    h.wait_attached().await;

    h.break_at("/srv/app.js", 9);
    h.wait_for("frame move", |h| {
        h.frames
            .0
            .lock()
            .unwrap()
            .contains(&Some(("/srv/app.js".to_owned(), 10)))
    })
    .await;
}

/// Scenario: paused with `x == 1`, step, next stop has `x == 2`. The
/// rendered line carries the change marker.
#[tokio::test]
async fn step_rerenders_with_change_marker() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(0, scope_with_number("x", 1, 100));
    h.send("attach").await;
    h.wait_attached().await;

    h.break_at("app.js", 9);
    h.wait_for("first render", |h| {
        h.last_render().is_some_and(|r| r.contains("x ={=} 1"))
    })
    .await;

    h.server.set_scope_body(0, scope_with_number("x", 2, 101));
    h.send("step").await;
    h.wait_for("step request", |h| h.server.count_requests("continue") == 1)
        .await;
    let requests = h.server.requests();
    let step = requests.iter().find(|r| r.command == "continue").unwrap();
    assert_eq!(step.arguments.as_ref().unwrap()["stepaction"], "next");
    assert_eq!(step.arguments.as_ref().unwrap()["stepcount"], 1);

    h.break_at("app.js", 10);
    h.wait_for("changed render", |h| {
        h.last_render().is_some_and(|r| r.contains("x ={*} 2"))
    })
    .await;
}

/// Scenario: a composite in Local; folding it open issues one `lookup` and
/// the children render one level deeper.
#[tokio::test]
async fn foldvar_expands_an_object_through_lookup() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(
        0,
        json!({
            "index": 0,
            "object": {
                "properties": [
                    {"name": "o", "value": {"type": "object", "className": "Object", "ref": 17}},
                ],
            },
        }),
    );
    h.server.set_lookup_mirror(
        17,
        json!({
            "handle": 17,
            "type": "object",
            "className": "Object",
            "properties": [{"name": "p", "ref": 18}],
        }),
    );
    h.server.set_lookup_refs(vec![RefValue {
        handle: 18,
        kind: "number".to_owned(),
        class_name: None,
        value: Some(json!(5)),
        text: Some("5".to_owned()),
        properties: None,
    }]);
    h.send("attach").await;
    h.wait_attached().await;

    h.break_at("app.js", 9);
    h.wait_for("first render", |h| {
        h.last_render().is_some_and(|r| r.contains("o ={=} <Object>"))
    })
    .await;

    // Line 1 is the Local root, line 2 is `o`.
    h.send("foldvar 2").await;
    h.wait_for("lookup", |h| h.server.count_requests("lookup") >= 1)
        .await;
    h.wait_for("expanded render", |h| {
        h.last_render().is_some_and(|r| r.contains("p ={=} 5"))
    })
    .await;

    let render = h.last_render().unwrap();
    let o_line = render.lines().find(|l| l.contains("o =")).unwrap();
    let p_line = render.lines().find(|l| l.contains("p =")).unwrap();
    assert!(o_line.contains("[-] o"), "o is open: {o_line:?}");
    let indent = |l: &str| l.chars().take_while(|c| *c == ' ').count();
    assert!(
        indent(p_line) > indent(o_line),
        "children indent one level deeper: {render:?}"
    );
}

/// Scenario: `print undefined_var` fails; the message is printed exactly
/// and nothing else changes.
#[tokio::test]
async fn evaluate_failure_prints_the_message() {
    let h = Harness::start().await;
    h.server.set_eval_outcome(
        "undefined_var",
        EvalOutcome::Failure {
            message: "ReferenceError: undefined_var is not defined".to_owned(),
        },
    );
    h.send("attach").await;
    h.send("print undefined_var").await;

    h.wait_for("error text", |h| {
        h.console_text()
            .contains("ReferenceError: undefined_var is not defined\n")
    })
    .await;
}

#[tokio::test]
async fn evaluate_success_renders_the_result() {
    let h = Harness::start().await;
    h.server.set_eval_outcome(
        "1 + 2",
        EvalOutcome::Success {
            body: json!({"handle": 5, "type": "number", "value": 3, "text": "3"}),
            refs: Vec::new(),
        },
    );
    h.send("attach").await;
    h.send("print 1 + 2").await;

    h.wait_for("result", |h| h.console_text().contains("3\n")).await;
}

#[tokio::test]
async fn backtrace_prints_joined_frame_texts() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(0, scope_with_number("x", 1, 100));
    h.server
        .set_backtrace_frames(&["#00 f() app.js line 10", "#01 main() app.js line 20"]);
    h.send("attach").await;
    h.wait_attached().await;

    // Backtrace only runs while paused.
    h.break_at("app.js", 9);
    h.wait_for("paused", |h| h.console_text().contains("Break in app.js.\n"))
        .await;
    h.send("backtrace").await;
    h.wait_for("backtrace text", |h| {
        h.console_text()
            .contains("#00 f() app.js line 10\n#01 main() app.js line 20\n")
    })
    .await;
}

/// An unanswered request is retired and surfaced once the timeout passes.
/// A raw listener that swallows every byte stands in for a wedged debuggee.
#[tokio::test]
async fn unanswered_requests_are_retired_by_the_sweep() {
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let config = BridgeConfig {
        host: "127.0.0.1".to_owned(),
        port,
        tick: Duration::from_millis(20),
        request_timeout: Duration::from_millis(40),
    };
    let console = TestConsole::default();
    let session = Session::new(
        config,
        console.clone(),
        TestFrameView::default(),
        TestVarView::default(),
    );
    let (lines, rx) = mpsc::channel(16);
    tokio::spawn(session.run(rx));

    lines.send("attach".to_owned()).await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if console
                .0
                .lock()
                .unwrap()
                .contains("Request 'scripts' timed out.\n")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the sweep notice");
}
