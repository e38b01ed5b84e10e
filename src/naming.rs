//! Storage-name grammar shared by the index file, the dump-file scan, and
//! the channel/subscriber model.
//!
//! A storage name is either `"channel"` (anonymous) or `"subscriber@channel"`
//! (subscriber may be empty, i.e. `"@channel"`). Exactly one `@` is allowed,
//! and it may not be the first or last character.

/// A parsed storage name: the subscriber part (empty for the default
/// subscriber created by promotion) and the channel part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageName {
    pub subscriber: Option<String>,
    pub channel: String,
}

impl StorageName {
    /// Parses `name` per the grammar above. Returns `Err(reason)` describing
    /// why the name is invalid.
    pub fn parse(name: &str) -> Result<Self, &'static str> {
        if name.is_empty() {
            return Err("storage name must not be empty");
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'@'))
        {
            return Err("storage name contains characters outside [A-Za-z0-9_-@]");
        }

        let at_count = name.bytes().filter(|&b| b == b'@').count();
        match at_count {
            0 => Ok(StorageName {
                subscriber: None,
                channel: name.to_string(),
            }),
            1 => {
                if name.starts_with('@') && name.len() == 1 {
                    return Err("'@' alone is not a valid storage name");
                }
                if name.ends_with('@') {
                    return Err("'@' may not be the last character");
                }
                let idx = name.find('@').unwrap();
                let subscriber = &name[..idx];
                let channel = &name[idx + 1..];
                if channel.is_empty() {
                    return Err("channel part of a subscriber storage name must not be empty");
                }
                Ok(StorageName {
                    subscriber: Some(subscriber.to_string()),
                    channel: channel.to_string(),
                })
            }
            _ => Err("at most one '@' is permitted in a storage name"),
        }
    }

    /// Reconstructs the canonical `subscriber@channel` / `channel` string.
    pub fn to_storage_id(&self) -> String {
        match &self.subscriber {
            Some(sub) => format!("{sub}@{}", self.channel),
            None => self.channel.clone(),
        }
    }

    /// The human-facing channel display id: the storage id with any leading
    /// `@` stripped, so the default (empty-name) subscriber reads as the
    /// bare channel name.
    pub fn display_id(storage_id: &str) -> &str {
        storage_id.strip_prefix('@').unwrap_or(storage_id)
    }
}

/// Builds the canonical storage id for subscriber `name` on `channel`.
pub fn subscriber_storage_id(subscriber: &str, channel: &str) -> String {
    format!("{subscriber}@{channel}")
}
