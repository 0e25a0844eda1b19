pub mod credential;
pub mod manager;
pub mod store;

pub use credential::{
    Credential, CredentialRuntime, CredentialStatus, JsonMap, SharedCredential, access_token,
    metadata_expiry,
};
pub use manager::{CredentialManager, RefreshError, TokenRefresher};
pub use store::{CredentialStore, FileStore, StoreError};
