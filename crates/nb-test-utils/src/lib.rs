// nb-test-utils: Shared test utilities for the bridge suite.
//
// Provides a scripted mock of the Node.js debugger for integration testing
// of the transport, dispatcher, and session controller.

pub mod mock_debugger;

pub use mock_debugger::{EvalOutcome, MockDebugger};
