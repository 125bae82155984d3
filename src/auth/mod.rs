//! Google Drive credentials: OAuth user tokens persisted in the secrets
//! directory, or a service account key.

mod google;
mod loopback;
mod store;
mod types;

pub use google::{GoogleAuth, TokenEndpoint};
pub use store::CredentialStore;
pub use types::{
    AccessToken, AuthMode, ClientSecrets, Credential, CredentialState, OAuthToken,
    ServiceAccountKey, DRIVE_SCOPE,
};
