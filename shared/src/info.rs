//! `\key\value` user info strings.

use crate::{ProtocolError, MAX_INFO_KEY, MAX_INFO_STRING, MAX_INFO_VALUE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bounded `\key\value\key\value` blob carried in connect requests and
/// user info updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoString(String);

impl InfoString {
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Accepts a raw info string from the network.
    ///
    /// Over-long strings and strings containing quotes, semicolons or
    /// control characters are refused outright rather than truncated, so a
    /// client can never smuggle a partial pair, or a line break into the
    /// status text, past the server.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() >= MAX_INFO_STRING {
            return Err(ProtocolError::InvalidInfo("too long"));
        }
        if raw.chars().any(|c| is_illegal(c) && c != '\\') {
            return Err(ProtocolError::InvalidInfo("illegal character"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let body = self.0.strip_prefix('\\').unwrap_or(&self.0);
        let mut parts = body.split('\\');
        std::iter::from_fn(move || {
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((key, value))
        })
        .filter(|(key, _)| !key.is_empty())
    }

    pub fn value_for_key(&self, key: &str) -> Option<&str> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn remove_key(&mut self, key: &str) {
        if self.value_for_key(key).is_none() {
            return;
        }
        let mut rebuilt = String::with_capacity(self.0.len());
        for (k, v) in self.pairs().filter(|(k, _)| *k != key) {
            rebuilt.push('\\');
            rebuilt.push_str(k);
            rebuilt.push('\\');
            rebuilt.push_str(v);
        }
        self.0 = rebuilt;
    }

    /// Sets `key` to `value`, replacing any previous value. An empty value
    /// removes the key.
    pub fn set_value_for_key(&mut self, key: &str, value: &str) -> Result<(), ProtocolError> {
        for s in [key, value] {
            if s.chars().any(is_illegal) {
                return Err(ProtocolError::InvalidInfo("illegal character"));
            }
        }
        if key.is_empty() || key.len() >= MAX_INFO_KEY || value.len() >= MAX_INFO_VALUE {
            return Err(ProtocolError::InvalidInfo("key or value too long"));
        }

        self.remove_key(key);
        if value.is_empty() {
            return Ok(());
        }

        if self.0.len() + key.len() + value.len() + 2 >= MAX_INFO_STRING {
            return Err(ProtocolError::InvalidInfo("info string length exceeded"));
        }

        self.0.push('\\');
        self.0.push_str(key);
        self.0.push('\\');
        self.0.push_str(value);
        Ok(())
    }
}

fn is_illegal(c: char) -> bool {
    matches!(c, '\\' | '"' | ';') || c.is_control()
}

impl fmt::Display for InfoString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_lookup() {
        let info = InfoString::parse(r"\name\player\rate\25000\msg\1").unwrap();
        assert_eq!(info.value_for_key("name"), Some("player"));
        assert_eq!(info.value_for_key("rate"), Some("25000"));
        assert_eq!(info.value_for_key("skin"), None);
    }

    #[test]
    fn test_set_replaces_existing_value() {
        let mut info = InfoString::parse(r"\name\player\rate\25000").unwrap();
        info.set_value_for_key("name", "other").unwrap();
        assert_eq!(info.value_for_key("name"), Some("other"));
        assert_eq!(info.pairs().count(), 2);
        assert_eq!(info.as_str(), r"\rate\25000\name\other");
    }

    #[test]
    fn test_empty_value_removes_key() {
        let mut info = InfoString::parse(r"\name\player\rejmsg\banned").unwrap();
        info.set_value_for_key("rejmsg", "").unwrap();
        assert_eq!(info.value_for_key("rejmsg"), None);
        assert_eq!(info.value_for_key("name"), Some("player"));
    }

    #[test]
    fn test_rejects_illegal_characters() {
        let mut info = InfoString::new();
        assert!(info.set_value_for_key("name", r"a\b").is_err());
        assert!(info.set_value_for_key("name", "a;b").is_err());
        assert!(InfoString::parse("\\name\\\"quoted\"").is_err());
        assert!(info.is_empty());
    }

    #[test]
    fn test_rejects_control_characters() {
        assert!(InfoString::parse("\\name\\evil\n999 5 fake").is_err());
        assert!(InfoString::parse("\\name\\tab\there").is_err());
        assert!(InfoString::parse("\\name\\bell\u{7}").is_err());

        let mut info = InfoString::new();
        assert!(info.set_value_for_key("name", "two\nlines").is_err());
        assert!(info.set_value_for_key("na\rme", "x").is_err());
        assert!(info.is_empty());
    }

    #[test]
    fn test_length_bound() {
        assert!(InfoString::parse(&"x".repeat(MAX_INFO_STRING)).is_err());

        let mut info = InfoString::new();
        let mut i = 0;
        while info.set_value_for_key(&format!("k{i}"), &"v".repeat(40)).is_ok() {
            i += 1;
        }
        assert!(info.as_str().len() < MAX_INFO_STRING);
    }
}
