use bytes::Bytes;

use crate::{
    err::{DecodeError, DecodeErrorKind},
    io::decode_utf8,
};

/// A topic filter as it appears in SUBSCRIBE/UNSUBSCRIBE, possibly containing
/// the `+`/`#` wildcards. This client validates filter syntax on the way out;
/// matching a filter against an inbound topic name is the broker's job and is
/// out of scope here.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        let string = decode_utf8(bytes)?;
        Self::from_str(&string)
    }

    pub fn from_str(str: &str) -> Result<Self, DecodeError> {
        if str.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedTopicFilter,
                "topic filter contains no bytes".into(),
            ));
        }

        let levels: Vec<&str> = str.split('/').collect();
        for (idx, level) in levels.iter().enumerate() {
            if level.contains('#') && (level.len() != 1 || idx != levels.len() - 1) {
                return Err(DecodeError::new(
                    DecodeErrorKind::MalformedTopicFilter,
                    format!("multi-level wildcard must occupy the final level alone in {str}"),
                ));
            }
            if level.contains('+') && level.len() != 1 {
                return Err(DecodeError::new(
                    DecodeErrorKind::MalformedTopicFilter,
                    format!("single-level wildcard must occupy its level alone in {str}"),
                ));
            }
        }

        Ok(Self(str.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A concrete topic name as it appears in PUBLISH: no wildcards permitted.
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone, Debug, Hash)]
pub struct TopicName(String);

impl TopicName {
    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        let string = decode_utf8(bytes)?;
        Self::from_str(&string)
    }

    pub fn from_str(str: &str) -> Result<Self, DecodeError> {
        if str.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedTopicName,
                "topic name contains no bytes".into(),
            ));
        }
        if str.contains('#') || str.contains('+') {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedTopicName,
                format!("topic name must not contain wildcards: {str}"),
            ));
        }

        Ok(Self(str.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_filters() {
        assert!(TopicFilter::from_str("sport/tennis/player1/#").is_ok());
        assert!(TopicFilter::from_str("sport/+/player1").is_ok());
        assert!(TopicFilter::from_str("$SYS/#").is_ok());
    }

    #[test]
    fn rejects_misplaced_wildcards() {
        assert!(TopicFilter::from_str("sport/tennis/#/ranking").is_err());
        assert!(TopicFilter::from_str("sport/tennis#").is_err());
    }

    #[test]
    fn rejects_wildcards_in_topic_names() {
        assert!(TopicName::from_str("a/+/b").is_err());
        assert!(TopicName::from_str("a/#").is_err());
        assert!(TopicName::from_str("a/b").is_ok());
    }
}
