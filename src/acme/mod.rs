//! ACME (RFC 8555) issuance endpoint
//!
//! HTTP-01 only. Accounts, orders, authorizations and challenges persist
//! under `acme/`; nonces and rate-limit buckets are in memory.

pub mod http01;
pub mod jws;
pub mod nonce;
pub mod problem;
pub mod routes;
pub mod service;
pub mod store;
pub mod types;

pub use http01::{ChallengeValidator, Http01Validator};
pub use problem::Problem;
pub use routes::router;
pub use service::AcmeService;
pub use store::AcmeStore;
