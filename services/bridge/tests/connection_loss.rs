//! Connection lifecycle: mid-session EOF resets the mirrors, detach is
//! clean, and a later attach re-promotes surviving breakpoints.

use bridge::{BridgeConfig, Console, FrameView, Session, VarView};
use nb_test_utils::MockDebugger;
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
struct TestVarView;
impl VarView for TestVarView {
    fn update(&mut self, _text: &str, _dirty: bool) {}
}

struct Harness {
    server: MockDebugger,
    lines: mpsc::Sender<String>,
    console: TestConsole,
    frames: TestFrameView,
    session: Option<tokio::task::JoinHandle<i32>>,
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
        let session = Session::new(config, console.clone(), frames.clone(), TestVarView);
        let (lines, rx) = mpsc::channel(16);
        let session = tokio::spawn(session.run(rx));
        Self {
            server,
            lines,
            console,
            frames,
            session: Some(session),
        }
    }

    async fn send(&self, line: &str) {
        self.lines.send(line.to_owned()).await.unwrap();
    }

    fn console_text(&self) -> String {
        self.console.0.lock().unwrap().clone()
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
}

/// Scenario: socket EOF mid-session. The close notice is printed, every
/// breakpoint drops to standby, and a later attach re-promotes it from the
/// first `scripts` response.
#[tokio::test]
async fn eof_resets_state_and_reattach_repromotes() {
    let h = Harness::start().await;
    h.server.set_scripts(&[("app.js", 4)]);
    h.send("attach").await;
    h.send("break app.js:10").await;
    h.wait_for("first ack", |h| {
        h.console_text()
            .contains("Breakpoint 1 at file app.js, line 10.\n")
    })
    .await;

    h.server.drop_connection();
    h.wait_for("close notice", |h| {
        h.console_text()
            .contains("Node.js debugger connection closed.\n")
    })
    .await;

    // The catalog survived; a new connection promotes it again.
    h.send("attach").await;
    h.wait_for("re-promotion", |h| h.server.count_requests("setbreakpoint") == 2)
        .await;
    h.wait_for("second ack", |h| {
        h.console_text()
            .contains("Breakpoint 2 at file app.js, line 10.\n")
    })
    .await;
}

#[tokio::test]
async fn close_hides_the_frame_sign() {
    let h = Harness::start().await;
    h.server.set_frame_scopes(&[(0, 1)]);
    h.server.set_scope_body(
        0,
        serde_json::json!({"index": 0, "object": {"properties": []}}),
    );
    h.send("attach").await;
    h.wait_for("attach", |h| h.server.count_requests("scripts") >= 1)
        .await;
    h.server.send_event(
        "break",
        serde_json::json!({"script": {"name": "/srv/app.js"}, "sourceLine": 9}),
    );
    h.wait_for("frame shown", |h| {
        h.frames
            .0
            .lock()
            .unwrap()
            .contains(&Some(("/srv/app.js".to_owned(), 10)))
    })
    .await;

    h.server.drop_connection();
    h.wait_for("frame hidden after close", |h| {
        h.frames.0.lock().unwrap().last() == Some(&None)
    })
    .await;
}

#[tokio::test]
async fn dettach_closes_cleanly_and_allows_reattach() {
    let h = Harness::start().await;
    h.send("attach").await;
    h.wait_for("first poll", |h| h.server.count_requests("scripts") >= 1)
        .await;

    h.send("dettach").await;
    h.wait_for("close notice", |h| {
        h.console_text()
            .contains("Node.js debugger connection closed.\n")
    })
    .await;
    assert_eq!(h.server.count_requests("disconnect"), 1);

    h.send("attach").await;
    h.wait_for("reattached", |h| {
        // A fresh connection polls scripts again.
        h.server.count_requests("scripts") >= 2
    })
    .await;
}

#[tokio::test]
async fn dettach_when_not_attached_reports_it() {
    let h = Harness::start().await;
    h.send("dettach").await;
    h.wait_for("notice", |h| {
        h.console_text()
            .contains("The inferior progam was not attached.\n")
    })
    .await;
}

#[tokio::test]
async fn quit_exits_with_code_zero() {
    let mut h = Harness::start().await;
    h.send("attach").await;
    h.wait_for("attached", |h| h.server.count_requests("scripts") >= 1)
        .await;
    h.send("quit").await;

    let code = timeout(Duration::from_secs(5), h.session.take().unwrap())
        .await
        .expect("session did not exit")
        .expect("session panicked");
    assert_eq!(code, 0);
    assert!(h.console_text().contains("Netbeans connection closed.\n"));
}

#[tokio::test]
async fn connect_refused_leaves_the_session_usable() {
    // Bind then drop to find a dead port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let config = BridgeConfig {
        host: "127.0.0.1".to_owned(),
        port: dead_port,
        tick: Duration::from_millis(20),
        ..BridgeConfig::default()
    };
    let console = TestConsole::default();
    let session = Session::new(config, console.clone(), TestFrameView::default(), TestVarView);
    let (lines, rx) = mpsc::channel(16);
    tokio::spawn(session.run(rx));

    lines.send("attach".to_owned()).await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if console
                .0
                .lock()
                .unwrap()
                .contains("Node.js debugger connection closed.\n")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refused connect must surface the close notice");

    // Still accepting commands afterwards.
    lines.send("frobnicate".to_owned()).await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if console.0.lock().unwrap().contains("Command ignored.\n") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session must stay usable after a refused attach");
}
