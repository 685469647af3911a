//! GitHub integration for BeeCI.
//!
//! Installation access tokens are minted from the App's private key by the
//! [`CredentialService`]; check runs are created and updated through
//! [`ChecksApi`]. [`GitHubClient`] implements both network seams.

pub mod checks;
pub mod client;
pub mod credentials;
pub mod error;

pub use checks::{CheckRunPayload, ChecksApi};
pub use client::GitHubClient;
pub use credentials::{
    AppCredentials, CredentialService, InstallationToken, InstallationTokens, TokenExchange,
};
pub use error::{GitHubError, GitHubResult};
