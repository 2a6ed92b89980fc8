//! Interactive shell sessions

mod login;
mod pty;

pub use login::{SingleUserCredential, MAX_LOGIN_ATTEMPTS};
pub use pty::{validate_shell_path, PtyShell};
