//! Kafka error classification.

use courier_core::TransportError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Classify a librdkafka error code.
pub(crate) fn from_code(code: RDKafkaErrorCode, context: String) -> TransportError {
    match code {
        RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownTopic
        | RDKafkaErrorCode::UnknownPartition
        | RDKafkaErrorCode::GroupIdNotFound => TransportError::NotFound(context),
        RDKafkaErrorCode::TopicAlreadyExists => TransportError::AlreadyExists(context),
        RDKafkaErrorCode::Destroy => TransportError::Cancelled(context),
        RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::OperationTimedOut => TransportError::Unavailable(context),
        _ => TransportError::Backend(context),
    }
}

/// Classify a client error.
pub(crate) fn from_kafka(error: &KafkaError) -> TransportError {
    let context = error.to_string();
    match error.rdkafka_error_code() {
        Some(code) => from_code(code, context),
        None => TransportError::Backend(context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_classified() {
        assert!(from_code(RDKafkaErrorCode::UnknownTopicOrPartition, "t".into()).is_not_found());
        assert!(from_code(RDKafkaErrorCode::GroupIdNotFound, "g".into()).is_not_found());
        assert!(from_code(RDKafkaErrorCode::TopicAlreadyExists, "t".into()).is_already_exists());
        assert!(from_code(RDKafkaErrorCode::Destroy, "closing".into()).is_cancelled());
        assert!(matches!(
            from_code(RDKafkaErrorCode::AllBrokersDown, "down".into()),
            TransportError::Unavailable(_)
        ));
        assert!(matches!(
            from_code(RDKafkaErrorCode::InvalidConfig, "bad".into()),
            TransportError::Backend(_)
        ));
    }
}
