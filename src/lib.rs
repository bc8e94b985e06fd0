pub mod clock;
pub mod config;
pub mod crypto;
pub mod decrypt;
pub mod engine;
pub mod error;
pub mod grant;
pub mod signer;
pub mod storage;
