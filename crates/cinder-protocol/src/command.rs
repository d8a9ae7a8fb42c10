//! Decoded client commands.
//!
//! A [`Command`] is the unit the session loop hands to the dispatcher:
//! the command name, uppercased for table lookup, and the argument bytes
//! exactly as they appeared on the wire.

use bytes::Bytes;

/// A single decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, uppercased ASCII. Empty for an empty command frame
    /// (`*0\r\n` or a blank inline line) - the dispatcher rejects those.
    pub name: String,
    /// Arguments in order, preserved verbatim (binary-clean).
    pub args: Vec<Bytes>,
}

impl Command {
    /// Builds a command from a name and arguments. The name is uppercased
    /// here so every consumer sees the canonical form.
    pub fn new(name: impl AsRef<str>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.as_ref().to_ascii_uppercase(),
            args,
        }
    }

    pub(crate) fn from_parts(mut parts: Vec<Bytes>) -> Self {
        if parts.is_empty() {
            return Self {
                name: String::new(),
                args: Vec::new(),
            };
        }
        let name_bytes = parts.remove(0);
        let name = String::from_utf8_lossy(&name_bytes).to_ascii_uppercase();
        Self { name, args: parts }
    }
}
