//! Authentication, session lifecycle and permission resolution.

pub mod authorize;
pub mod blacklist;
pub mod client;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod login;
pub mod models;
pub mod permissions;
pub mod seed;
pub mod session;
pub mod store;
pub mod token;
pub mod validation;

pub use authorize::{AuthorizationService, Decision, PermissionSource, PolicyRegistry, Requirement};
pub use error::{AuthError, AuthResult};
pub use login::{LoginRequest, LoginResponse, LoginService, RefreshResponse};
pub use token::{JwtSettings, Principal, TokenCodec};
