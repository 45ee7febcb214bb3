//! Topic construction and identity validation for the CloudPlugs MQTT protocol
//!
//! Every topic the client publishes or subscribes to is produced here so the
//! wire layout lives in one place. All functions are pure.
//!
//! | Purpose                 | Topic                     |
//! |-------------------------|---------------------------|
//! | data publish            | `{plug}/data/{topic}`     |
//! | property get request    | `{plug}/property/get`     |
//! | property set request    | `{plug}/property/set`     |
//! | property reply          | `{plug}/property/reply`   |
//! | enroll request          | `enroll/{hwid}`           |
//! | enroll-ctrl request     | `enroll/{hwid}/ctrl`      |
//! | enroll reply            | `enroll/{hwid}/reply`     |

use crate::error::ClientError;
use std::fmt;
use thiserror::Error;

/// Characters that may never appear inside a single identity segment
const RESERVED_IDENTITY_CHARS: [char; 4] = ['/', '+', '#', '\0'];

/// What an identity string names, for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    PlugId,
    HardwareId,
    ModelId,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentityKind::PlugId => "plug id",
            IdentityKind::HardwareId => "hardware id",
            IdentityKind::ModelId => "model id",
        };
        f.write_str(name)
    }
}

/// Validation errors for identities and topics
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    EmptyIdentity(IdentityKind),
    #[error("{kind} contains reserved character {ch:?}")]
    ReservedIdentityChar { kind: IdentityKind, ch: char },
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic '{topic}' contains reserved character {ch:?}")]
    ReservedTopicChar { topic: String, ch: char },
    #[error("Topic filter '{0}' uses a wildcard outside a whole level")]
    MisplacedWildcard(String),
    #[error("Property key cannot be empty")]
    EmptyPropertyKey,
}

impl From<ValidationError> for ClientError {
    fn from(error: ValidationError) -> Self {
        ClientError::validation(error.to_string())
    }
}

/// Validate a plug id, hardware id or model id used as a topic segment
pub fn validate_identity(identity: &str, kind: IdentityKind) -> Result<(), ValidationError> {
    if identity.is_empty() {
        return Err(ValidationError::EmptyIdentity(kind));
    }

    for ch in identity.chars() {
        if RESERVED_IDENTITY_CHARS.contains(&ch) {
            return Err(ValidationError::ReservedIdentityChar { kind, ch });
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing (no wildcards)
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if let Some(ch) = topic.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(ValidationError::ReservedTopicChar {
            topic: topic.to_string(),
            ch,
        });
    }

    Ok(())
}

/// Validate a subscription filter: `+` must fill a whole level, `#` must be the last level
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if filter.contains('\0') {
        return Err(ValidationError::ReservedTopicChar {
            topic: filter.to_string(),
            ch: '\0',
        });
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        let has_plus = level.contains('+');
        let has_hash = level.contains('#');
        if (has_plus && *level != "+")
            || (has_hash && *level != "#")
            || (has_hash && index != last)
        {
            return Err(ValidationError::MisplacedWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Topic construction for the CloudPlugs platform
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build data topic: `{plug_of}/data/{topic}`
    pub fn build_data_topic(topic: &str, plug_id_of: &str) -> Result<String, ValidationError> {
        validate_identity(plug_id_of, IdentityKind::PlugId)?;
        validate_publish_topic(topic)?;
        Ok(format!("{plug_id_of}/data/{topic}"))
    }

    /// Build a subscription filter, scoped under `{plug}/data/` when `prefix` is set
    pub fn build_subscribe_topic(
        topic: &str,
        prefix: bool,
        plug_id: Option<&str>,
    ) -> Result<String, ValidationError> {
        validate_topic_filter(topic)?;
        if !prefix {
            return Ok(topic.to_string());
        }

        let plug_id = plug_id.ok_or(ValidationError::EmptyIdentity(IdentityKind::PlugId))?;
        validate_identity(plug_id, IdentityKind::PlugId)?;
        Ok(format!("{plug_id}/data/{topic}"))
    }

    /// Build property get request topic: `{plug}/property/get`
    pub fn build_property_get_topic(plug_id: &str) -> Result<String, ValidationError> {
        validate_identity(plug_id, IdentityKind::PlugId)?;
        Ok(format!("{plug_id}/property/get"))
    }

    /// Build property set request topic: `{plug}/property/set`
    pub fn build_property_set_topic(plug_id: &str) -> Result<String, ValidationError> {
        validate_identity(plug_id, IdentityKind::PlugId)?;
        Ok(format!("{plug_id}/property/set"))
    }

    /// Build property reply topic: `{plug}/property/reply`
    /// Note: get and set share this topic; replies are told apart by correlation id
    pub fn build_property_reply_topic(plug_id: &str) -> Result<String, ValidationError> {
        validate_identity(plug_id, IdentityKind::PlugId)?;
        Ok(format!("{plug_id}/property/reply"))
    }

    /// Build enrollment request topic: `enroll/{hwid}`
    pub fn build_enroll_topic(hwid: &str) -> Result<String, ValidationError> {
        validate_identity(hwid, IdentityKind::HardwareId)?;
        Ok(format!("enroll/{hwid}"))
    }

    /// Build controller enrollment request topic: `enroll/{ctrl_hwid}/ctrl`
    pub fn build_enroll_ctrl_topic(ctrl_hwid: &str) -> Result<String, ValidationError> {
        validate_identity(ctrl_hwid, IdentityKind::HardwareId)?;
        Ok(format!("enroll/{ctrl_hwid}/ctrl"))
    }

    /// Build enrollment reply topic: `enroll/{hwid}/reply`
    pub fn build_enroll_reply_topic(hwid: &str) -> Result<String, ValidationError> {
        validate_identity(hwid, IdentityKind::HardwareId)?;
        Ok(format!("enroll/{hwid}/reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_construction() {
        assert_eq!(
            TopicBuilder::build_data_topic("t1", "dev-1").unwrap(),
            "dev-1/data/t1"
        );
        assert_eq!(
            TopicBuilder::build_property_get_topic("dev-1").unwrap(),
            "dev-1/property/get"
        );
        assert_eq!(
            TopicBuilder::build_property_set_topic("dev-1").unwrap(),
            "dev-1/property/set"
        );
        assert_eq!(
            TopicBuilder::build_property_reply_topic("dev-1").unwrap(),
            "dev-1/property/reply"
        );
        assert_eq!(
            TopicBuilder::build_enroll_topic("HW-1").unwrap(),
            "enroll/HW-1"
        );
        assert_eq!(
            TopicBuilder::build_enroll_ctrl_topic("HW-2").unwrap(),
            "enroll/HW-2/ctrl"
        );
        assert_eq!(
            TopicBuilder::build_enroll_reply_topic("HW-1").unwrap(),
            "enroll/HW-1/reply"
        );
    }

    #[test]
    fn test_nested_data_topic() {
        assert_eq!(
            TopicBuilder::build_data_topic("sensors/temp", "dev-1").unwrap(),
            "dev-1/data/sensors/temp"
        );
    }

    #[test]
    fn test_subscribe_topic_prefix_policy() {
        assert_eq!(
            TopicBuilder::build_subscribe_topic("alerts", true, Some("dev-1")).unwrap(),
            "dev-1/data/alerts"
        );
        assert_eq!(
            TopicBuilder::build_subscribe_topic("raw/topic", false, Some("dev-1")).unwrap(),
            "raw/topic"
        );
        assert_eq!(
            TopicBuilder::build_subscribe_topic("raw/topic", false, None).unwrap(),
            "raw/topic"
        );
        assert_eq!(
            TopicBuilder::build_subscribe_topic("alerts", true, None),
            Err(ValidationError::EmptyIdentity(IdentityKind::PlugId))
        );
    }

    #[test]
    fn test_subscribe_wildcards() {
        assert!(TopicBuilder::build_subscribe_topic("sensors/+/temp", true, Some("d")).is_ok());
        assert!(TopicBuilder::build_subscribe_topic("sensors/#", true, Some("d")).is_ok());
        assert!(TopicBuilder::build_subscribe_topic("#", false, None).is_ok());
        assert!(matches!(
            TopicBuilder::build_subscribe_topic("sensors/#/temp", true, Some("d")),
            Err(ValidationError::MisplacedWildcard(_))
        ));
        assert!(matches!(
            TopicBuilder::build_subscribe_topic("sens+ors", true, Some("d")),
            Err(ValidationError::MisplacedWildcard(_))
        ));
    }

    #[test]
    fn test_publish_topic_rejects_wildcards() {
        assert!(matches!(
            TopicBuilder::build_data_topic("a/+", "dev-1"),
            Err(ValidationError::ReservedTopicChar { ch: '+', .. })
        ));
        assert!(matches!(
            TopicBuilder::build_data_topic("a/#", "dev-1"),
            Err(ValidationError::ReservedTopicChar { ch: '#', .. })
        ));
        assert_eq!(
            TopicBuilder::build_data_topic("", "dev-1"),
            Err(ValidationError::EmptyTopic)
        );
    }

    #[test]
    fn test_identity_validation_examples() {
        assert!(validate_identity("dev-0000000000000001", IdentityKind::PlugId).is_ok());
        assert!(validate_identity("SN:42 rev.B", IdentityKind::HardwareId).is_ok());

        assert_eq!(
            validate_identity("", IdentityKind::PlugId),
            Err(ValidationError::EmptyIdentity(IdentityKind::PlugId))
        );
        assert_eq!(
            validate_identity("a/b", IdentityKind::HardwareId),
            Err(ValidationError::ReservedIdentityChar {
                kind: IdentityKind::HardwareId,
                ch: '/'
            })
        );
        assert!(validate_identity("dev+1", IdentityKind::PlugId).is_err());
        assert!(validate_identity("dev#1", IdentityKind::PlugId).is_err());
    }

    #[test]
    fn test_validation_error_converts_to_client_error() {
        let error: ClientError = ValidationError::EmptyTopic.into();
        assert!(matches!(error, ClientError::Validation { .. }));
    }

    proptest! {
        #[test]
        fn valid_identities_build_scoped_topics(id in "[a-zA-Z0-9._:-]{1,64}") {
            let topic = TopicBuilder::build_property_reply_topic(&id).unwrap();
            prop_assert!(topic.starts_with(&id));
            prop_assert_eq!(topic.split('/').count(), 3);
        }

        #[test]
        fn identities_with_separators_are_rejected(
            head in "[a-z0-9]{0,8}",
            sep in "[/+#]",
            tail in "[a-z0-9]{0,8}",
        ) {
            let id = format!("{head}{sep}{tail}");
            prop_assert!(validate_identity(&id, IdentityKind::PlugId).is_err());
        }

        #[test]
        fn data_topic_keeps_application_topic_verbatim(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}") {
            let built = TopicBuilder::build_data_topic(&topic, "dev-1").unwrap();
            prop_assert_eq!(built, format!("dev-1/data/{topic}"));
        }
    }
}
