//! Subject resolver for broker and event subjects.
//!
//! Broker subjects hang off a configurable prefix. Event subjects are the
//! event (channel) names themselves, validated so a bad name fails before
//! anything is sent or subscribed.

use std::fmt;

use crate::error::{NatsError, NatsResult};

/// Default prefix of the broker subjects.
pub const DEFAULT_SUBJECT_PREFIX: &str = "courier";

/// Broker endpoints addressed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerSubject {
    /// tracked publishes
    Publish,
    /// unseen queries
    Unseen,
    /// seen acknowledgements
    Seen,
}

impl fmt::Display for BrokerSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerSubject::Publish => write!(f, "publish"),
            BrokerSubject::Unseen => write!(f, "unseen"),
            BrokerSubject::Seen => write!(f, "seen"),
        }
    }
}

/// All broker subjects, for iteration.
pub const ALL_BROKER_SUBJECTS: &[BrokerSubject] = &[
    BrokerSubject::Publish,
    BrokerSubject::Unseen,
    BrokerSubject::Seen,
];

/// Maps broker endpoints and event names to concrete NATS subjects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectResolver {
    publish: String,
    unseen: String,
    seen: String,
}

impl SubjectResolver {
    /// Resolver using [`DEFAULT_SUBJECT_PREFIX`].
    pub fn with_defaults() -> Self {
        Self::build(DEFAULT_SUBJECT_PREFIX)
    }

    /// Resolver for `{prefix}.publish`, `{prefix}.unseen` and `{prefix}.seen`.
    ///
    /// Returns an error if the prefix is empty, contains wildcards or
    /// whitespace, or still holds an unresolved `{…}` placeholder.
    pub fn with_prefix(prefix: &str) -> NatsResult<Self> {
        let prefix = prefix.trim().trim_end_matches('.');
        validate_subject("subject prefix", prefix)?;
        Ok(Self::build(prefix))
    }

    fn build(prefix: &str) -> Self {
        Self {
            publish: format!("{prefix}.publish"),
            unseen: format!("{prefix}.unseen"),
            seen: format!("{prefix}.seen"),
        }
    }

    /// Concrete subject of a broker endpoint.
    pub fn broker(&self, subject: BrokerSubject) -> &str {
        match subject {
            BrokerSubject::Publish => &self.publish,
            BrokerSubject::Unseen => &self.unseen,
            BrokerSubject::Seen => &self.seen,
        }
    }

    /// Subject an event is published and subscribed on.
    pub fn event<'a>(&self, event_name: &'a str) -> NatsResult<&'a str> {
        validate_subject("event name", event_name)?;
        Ok(event_name)
    }
}

impl Default for SubjectResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn validate_subject(what: &str, subject: &str) -> NatsResult<()> {
    if subject.trim().is_empty() {
        return Err(NatsError::Config(format!("{what} is empty")));
    }
    if subject.contains('{') || subject.contains('}') {
        return Err(NatsError::Config(format!(
            "{what} contains unresolved placeholder: {subject}"
        )));
    }
    if subject.contains(['*', '>']) || subject.chars().any(char::is_whitespace) {
        return Err(NatsError::Config(format!(
            "{what} is not a valid subject: '{subject}'"
        )));
    }
    if subject.starts_with('.') || subject.contains("..") {
        return Err(NatsError::Config(format!(
            "{what} has an empty token: '{subject}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subjects() {
        let resolver = SubjectResolver::with_defaults();
        assert_eq!(resolver.broker(BrokerSubject::Publish), "courier.publish");
        assert_eq!(resolver.broker(BrokerSubject::Unseen), "courier.unseen");
        assert_eq!(resolver.broker(BrokerSubject::Seen), "courier.seen");
    }

    #[test]
    fn test_custom_prefix() {
        let resolver = SubjectResolver::with_prefix("myorg.bus.").unwrap();
        assert_eq!(resolver.broker(BrokerSubject::Unseen), "myorg.bus.unseen");
        for subject in ALL_BROKER_SUBJECTS {
            assert!(resolver.broker(*subject).starts_with("myorg.bus."));
        }
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        for prefix in ["", "   ", "{env}.bus", "bus.*", "my bus", "a..b"] {
            let err = SubjectResolver::with_prefix(prefix).unwrap_err();
            assert!(matches!(err, NatsError::Config(_)), "{prefix}");
        }
        let msg = SubjectResolver::with_prefix("{env}").unwrap_err().to_string();
        assert!(msg.contains("unresolved placeholder"));
    }

    #[test]
    fn test_event_subject() {
        let resolver = SubjectResolver::with_defaults();
        assert_eq!(resolver.event("orders.created").unwrap(), "orders.created");
        assert!(resolver.event("").is_err());
        assert!(resolver.event("orders.>").is_err());
    }

    #[test]
    fn test_broker_subject_display() {
        assert_eq!(BrokerSubject::Publish.to_string(), "publish");
        assert_eq!(BrokerSubject::Seen.to_string(), "seen");
    }
}
