//! Bearer token verification.
//!
//! This module provides the identity extractor: verification of HMAC-signed
//! JWTs against the shared secret, and minting of test tokens.

pub mod jwt;

pub use jwt::{Claims, MintClaims, TokenError, extract_identity, mint_token, validate_token};
