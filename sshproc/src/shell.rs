//! Opt-in quoting for values placed on a remote command line.
//!
//! [`Connection::spawn`](crate::Connection::spawn) sends the command string
//! as-is and never escapes anything. Callers that interpolate untrusted values
//! should pass them through [`quote`] or [`join`] first.

/// Quote a single argument for a POSIX shell.
///
/// Strings made only of safe characters are returned unchanged; anything else
/// is wrapped in single quotes with embedded quotes spliced as `'\''`.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Quote every argument and join them with spaces.
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
}
