pub mod anchor;
pub mod canon;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod intent;
pub mod io;
pub mod keyring;
pub mod paths;
pub mod platform;
pub mod policy;
pub mod queue;
pub mod receipt;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{ErrorCode, PlatformError, Result};
pub use platform::Platform;
