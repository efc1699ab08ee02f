//! End-to-end integration tests for frameflow.
//!
//! These tests exercise the real server over TCP:
//! - Pipeline selection during the WebSocket upgrade
//! - Frame validation and per-frame responses
//! - Load shedding and slow-down warnings
//! - Session teardown on client close and server shutdown

#![cfg(test)]
