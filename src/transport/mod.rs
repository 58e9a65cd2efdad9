pub mod session;

pub use session::{ServeSession, SshTarget};
