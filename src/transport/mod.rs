//! Network side of the server: the wire protocol and the WebSocket
//! listener that feeds decoded frames to connections.

pub mod message;
pub mod websocket;


#[cfg(test)]
mod websocket_tests;
