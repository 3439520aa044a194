// tether-test-utils: in-process WebSocket servers for exercising the client.
//
// Test-only crate; nothing here ships in the library.

mod mock_ws_server;

pub use mock_ws_server::{Behavior, GREETING_ACK_ID, MockWsServer};
