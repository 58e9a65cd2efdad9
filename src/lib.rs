//! cfsync: promise locking and delta file streaming for configuration
//! management agents.
//!
//! - [`locks`]: time-bounded mutual exclusion for promises across agent
//!   processes, backed by a shared [`store`].
//! - [`delta`] and [`stream`]: rsync-style transfer of one file over a
//!   framed byte stream.

pub mod config;
pub mod delta;
pub mod error;
pub mod locks;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use error::{ConfigError, DeltaError, StoreError, StreamError};
