pub mod memory;
pub mod pg;
pub mod repo_types;
pub mod store;

pub use repo_types::{NewUser, PublicUser, User};
pub use store::{TimeoutStore, UserStore};
