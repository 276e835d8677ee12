//! # Data Retrieval Module
//!
//! Generic HTTP clients shared by the external collaborators of the engine.
//!
//! - **`ky_http`**: `ApiClient`, a `reqwest` client with retry middleware
//!   (exponential backoff). The oEmbed renderer is built on it.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
