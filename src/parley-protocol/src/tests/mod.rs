//! Tests for the wire protocol.
