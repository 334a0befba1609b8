//! Provider integration layer.
//!
//! Holds provider configuration, the credential signer, the
//! [`adapter::ProviderAdapter`] contract, a shared HTTP helper, and one
//! adapter per external generation service.

pub mod adapter;
pub mod comet;
pub mod config;
pub mod credential;
pub mod error;
pub mod fal;
pub mod http;
pub mod kling;
pub mod suno;
