//! Authentication session lifecycle.
//!
//! This crate provides the client-side session core:
//! - [`SessionMachine`]: the state machine driving login, refresh and logout
//!   through an injected [`AuthGateway`](realmgate_oauth::AuthGateway)
//! - Single-flight refresh with bounded retry and backoff
//! - Ordered, synchronous state-change subscriptions
//! - [`authorize`]: the capability guard for protected resources
//!
//! # Example
//!
//! ```rust,ignore
//! use realmgate_session::{SessionConfig, SessionMachine, authorize};
//!
//! let machine = SessionMachine::new(gateway, SessionConfig::new(Duration::from_secs(10)));
//! machine.submit_login(&Credentials::password("alice", "secret")).await?;
//!
//! if authorize(&machine.snapshot(), ["admin"]).is_allowed() {
//!     // ...
//! }
//! ```

mod config;
mod guard;
mod machine;
mod state;
mod subscribers;

pub use config::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_REFRESH_LEEWAY,
    RetryPolicy, SessionConfig,
};
pub use guard::{Capability, Decision, DenyReason, authorize, authorize_at};
pub use machine::SessionMachine;
pub use realmgate_oauth::{AuthError, Result};
pub use state::{Session, SessionState, StateChange};
pub use subscribers::{Listener, SubscriptionId};
