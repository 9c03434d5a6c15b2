//! Defines the [Message] abstraction shared by every kind of domain
//! value this crate moves around: Domain [Event][crate::event::Envelope]s,
//! Domain [Command][crate::command::Envelope]s and the outbound
//! notifications delivered through the [Outbox][crate::outbox].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named piece of domain data.
///
/// The name is the stable, domain-level discriminator of the payload
/// (`"AmountWasDeposited"`, `"WithdrawAmount"`, ...): storage drivers
/// use it as a type tag when encoding the payload to their wire format,
/// and the command handler stamps it on its log lines.
pub trait Message {
    /// Returns the domain name of the [Message].
    fn name(&self) -> &'static str;
}

/// Contextual key-value entries travelling next to a [Message] payload:
/// correlation ids, tenant hints, trace contexts and the like.
///
/// Metadata never participates in domain equality -- two payloads are
/// the same Domain Event no matter the context they were recorded in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    /// Records an entry, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value recorded under the specified key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if no entries have been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the recorded entries, in no particular
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// A [Message] payload together with its [Metadata]: the unit the
/// Journal stores and the command handler consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T>
where
    T: Message,
{
    /// The message payload.
    pub message: T,
    /// Context recorded alongside the payload.
    pub metadata: Metadata,
}

impl<T> Envelope<T>
where
    T: Message,
{
    /// Attaches a [Metadata] entry to the envelope.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

impl<T> From<T> for Envelope<T>
where
    T: Message,
{
    fn from(message: T) -> Self {
        Envelope {
            message,
            metadata: Metadata::default(),
        }
    }
}

impl<T> PartialEq for Envelope<T>
where
    T: Message + PartialEq,
{
    fn eq(&self, other: &Envelope<T>) -> bool {
        // See the Metadata docs: context does not affect domain equality.
        self.message == other.message
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal named payload used by the storage tests across the crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TextMessage(pub(crate) &'static str);

    impl Message for TextMessage {
        fn name(&self) -> &'static str {
            "text_message"
        }
    }

    #[test]
    fn metadata_does_not_affect_envelope_equality() {
        let bare = Envelope::from(TextMessage("transfer"));

        let annotated = bare
            .clone()
            .with_metadata("correlation_id", "ce9d1f4a")
            .with_metadata("tenant", "acme");

        assert_eq!(bare, annotated);
    }

    #[test]
    fn metadata_entries_are_retrievable_by_key() {
        let envelope =
            Envelope::from(TextMessage("transfer")).with_metadata("tenant", "acme");

        assert_eq!(Some("acme"), envelope.metadata.get("tenant"));
        assert_eq!(None, envelope.metadata.get("correlation_id"));
        assert!(!envelope.metadata.is_empty());
    }

    #[test]
    fn inserting_under_the_same_key_replaces_the_value() {
        let mut metadata = Metadata::default();

        metadata.insert("attempt", "1");
        metadata.insert("attempt", "2");

        assert_eq!(Some("2"), metadata.get("attempt"));
        assert_eq!(1, metadata.iter().count());
    }
}
