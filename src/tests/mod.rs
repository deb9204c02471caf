//! Consolidated test modules.
//!
//! End-to-end tests drive the full router with `tower::ServiceExt::oneshot`.
