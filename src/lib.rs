//! Access-control decision service.
//!
//! A reverse proxy asks `/decisions/...` whether a request may pass. The answer
//! comes from the one [`rule`] matching the request URL and method: its
//! [`authn`] chain establishes who is calling, and its [`authz`] handler decides
//! whether that caller may proceed.

pub mod authn;
pub mod authz;
pub mod config;
pub mod credentials;
pub mod http_client;
#[cfg(feature = "server")]
pub mod observability;
pub mod pipeline;
pub mod routes;
pub mod rule;
pub mod scope;

#[cfg(test)]
mod tests;
