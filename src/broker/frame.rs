// ABOUTME: Return-address framing for messages moving through the broker relay
// ABOUTME: Wraps an opaque envelope line with the route back to the worker that sent it

//! Routed frames.
//!
//! When the front intake admits a line from a worker connection it pushes that
//! connection's identity onto the frame's route. Back dispatch and the reply
//! sink carry the route untouched. On the way back, the front intake pops the
//! identity and writes the body to that connection only.
//!
//! The body is the raw envelope line. Nothing in the relay parses it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while framing relay traffic
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame line could not be decoded
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Identity of one accepted worker connection on the front intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Generate a new unique connection id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a route hop back into a connection id.
    #[must_use]
    pub fn parse(hop: &str) -> Option<Self> {
        Uuid::parse_str(hop).ok().map(Self)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An envelope line plus the return-address hops it has collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedFrame {
    /// Return-address hops, innermost (first admitted) last
    pub route: Vec<String>,
    /// Raw envelope line, without the trailing newline
    pub body: String,
}

impl RoutedFrame {
    /// Admit a line received on a worker connection.
    pub fn admit(connection: ConnectionId, body: impl Into<String>) -> Self {
        Self {
            route: vec![connection.to_string()],
            body: body.into(),
        }
    }

    /// Build a reply that travels back along `route`.
    #[must_use]
    pub fn reply_along(route: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            route,
            body: body.into(),
        }
    }

    /// Remove and return the outermost hop.
    pub fn pop_hop(&mut self) -> Option<String> {
        self.route.pop()
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, FrameError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_records_connection() {
        let connection = ConnectionId::new();
        let frame = RoutedFrame::admit(connection, r#"{"__cb":"a","msg":1}"#);
        assert_eq!(frame.route, vec![connection.to_string()]);
    }

    #[test]
    fn test_body_survives_framing_byte_for_byte() {
        // Odd spacing and key order must come back exactly as sent.
        let body = r#"{ "msg" : {"b":2,"a":1},   "__cb":"x\ty" }"#;
        let frame = RoutedFrame::admit(ConnectionId::new(), body);

        let line = frame.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let decoded = RoutedFrame::from_line(&line).unwrap();
        assert_eq!(decoded.body, body);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_pop_hop_returns_connection() {
        let connection = ConnectionId::new();
        let mut frame = RoutedFrame::admit(connection, "{}");

        let hop = frame.pop_hop().unwrap();
        assert_eq!(ConnectionId::parse(&hop), Some(connection));
        assert!(frame.pop_hop().is_none());
    }

    #[test]
    fn test_malformed_frame() {
        assert!(RoutedFrame::from_line("{not a frame}").is_err());
    }
}
