//! Provisioning glue run alongside the resize: SSH keys and OS accounts.

pub mod ssh;
pub mod user;

pub use ssh::{authorize_ssh_keys, authorized_keys_path, render_authorized_keys};
pub use user::{create_user, lock_unlock_user, set_user_password, AccountBackend, UserSpec};
