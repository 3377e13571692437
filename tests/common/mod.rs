//! Shared helpers for integration test suites.

#![allow(dead_code)]
