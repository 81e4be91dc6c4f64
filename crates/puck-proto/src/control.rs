//! The control-bus line codec.
//!
//! The engine daemon, the hasher daemon and any front-end speak the same
//! dialect over local stream sockets: one command per newline-terminated
//! line, verb and arguments separated by `$`. Literal `$`, `|` and `&`
//! inside an argument travel as numeric entities (see [`crate::escape`]).

use crate::escape;

/// Encode a verb and its arguments into one control line (no newline)
#[must_use]
pub fn encode(verb: &str, args: &[&str]) -> String {
    let mut line = String::from(verb);
    for arg in args {
        line.push('$');
        line.push_str(&escape::escape(arg));
    }
    line
}

/// Decode a control line into its verb and unescaped arguments
#[must_use]
pub fn decode(line: &str) -> (String, Vec<String>) {
    let mut fields = line.split('$');
    let verb = fields.next().unwrap_or("").to_string();
    let args = fields.map(escape::unescape).collect();
    (verb, args)
}
