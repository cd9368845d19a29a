//! POSIX shell quoting for remote argument vectors
//!
//! `ssh` joins its trailing arguments with spaces and hands the result to the
//! remote login shell, so each argument is escaped first. Words made only of
//! shell-safe characters pass through unchanged.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Quote one argument so a POSIX shell reads it back unchanged
pub fn quote(arg: &str) -> String {
    escape(Cow::Borrowed(arg)).into_owned()
}

/// Quote every argument and join with spaces
pub fn quote_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
