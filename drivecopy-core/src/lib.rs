pub mod auth;
pub mod backoff;
mod client;
pub mod directory;
pub mod http;
mod oauth;

pub use auth::{CredentialError, Credentials, StaticToken, TokenSource};
pub use backoff::Backoff;
pub use client::{
    ApiError, ChildPage, DriveClient, DriveItem, FOLDER_FIELDS, LISTING_FIELDS, RemoteFile,
    UploadSession, UploadStatus, clean_name, is_session_gone,
};
pub use directory::{DirectoryClient, Drive, Site, User};
pub use http::{
    CallRequest, CallResponse, RobustHttp, StatusClass, ThrottleObserver, TransportError,
    classify_status, is_throttle, parse_retry_after,
};
pub use oauth::{ClientCredentials, DEFAULT_SCOPE, OAuthClient, OAuthError, OAuthToken};
