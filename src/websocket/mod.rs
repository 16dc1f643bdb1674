//! WebSocket Transport
//!
//! Bridges client WebSocket sessions to the adapter service.
//!
//! ## Architecture
//!
//! - **Handler**: upgrades HTTP requests and starts a pump per connection
//! - **Pump**: per-connection lifecycle, inbound frames and the writer task
//! - **Queue**: bounded drop-oldest buffer of deliveries
//! - **Messages**: JSON frames of the command endpoint
//!
//! ## Endpoints
//!
//! - `/channels/{id}/messages[/{subtopic}]` - bound to one channel; the
//!   token is checked before the upgrade, every frame is a payload
//! - `/ws` - JSON commands for any number of channels
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8180/ws?authorization=<token>');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', channel: 'temperature/>'}));
//!   ws.send(JSON.stringify({type: 'publish', channel: 'alerts', payload: 'fire', content_type: 'text/plain'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log('Received:', msg);
//! };
//! ```

mod handler;
mod messages;
mod pump;
mod queue;

pub use handler::{channel_handler, command_handler};
pub use messages::{ClientMessage, PayloadEncoding, ServerMessage};
pub use pump::{ConnectionPump, PumpMode, PumpSettings, PumpState};
pub use queue::{OutboundQueue, PushOutcome};
