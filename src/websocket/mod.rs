//! WebSocket Real-Time Transport
//!
//! Carries hub operations and room broadcasts between chat clients and the
//! server.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: Live connections and their room subscriptions
//! - **Handler**: Authenticates the handshake, upgrades, dispatches frames
//! - **Messages**: Client and server frame formats
//!
//! ## Usage
//!
//! Clients connect to `/ws?access_token=<jwt>` and then join rooms:
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket(`ws://localhost:8090/ws?access_token=${token}`);
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'join_room', room: 'General'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.type === 'message_received') render(msg.sender, decrypt(msg.content));
//! };
//! ```

mod handler;
mod messages;
mod registry;

pub use handler::{authenticate, websocket_handler, HandshakeParams};
pub use messages::{ClientMessage, ServerEvent};
pub use registry::{ConnectionId, ConnectionRegistry, RegistryConfig, RegistryError};
