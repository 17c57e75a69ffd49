//! JSON request bodies of the business API.

use sekretess_core::MessageType;
use serde::Serialize;

/// Body of the direct-message and key-distribution endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessageRequest<'a> {
    /// Base64 ciphertext
    pub text: &'a str,
    /// Consumer name
    #[serde(rename = "consumerExchange")]
    pub consumer_exchange: &'a str,
    /// Message type tag; absent for out-of-band key distribution
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
}

/// Body of the broadcast endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendAdMessageRequest<'a> {
    /// Base64 broadcast ciphertext
    pub text: &'a str,
    /// Business name the broadcast is published under
    #[serde(rename = "businessExchange")]
    pub business_exchange: &'a str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use sekretess_core::ConsumerKeysResponse;

    use super::*;

    #[test]
    fn direct_message_body() {
        let body = SendMessageRequest {
            text: "Y2lwaGVy",
            consumer_exchange: "alice",
            message_type: Some(MessageType::KeyDist),
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"text": "Y2lwaGVy", "consumerExchange": "alice", "type": "KEY_DIST"})
        );
    }

    #[test]
    fn key_distribution_body_omits_type() {
        let body =
            SendMessageRequest { text: "ZGlzdA==", consumer_exchange: "alice", message_type: None };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"text": "ZGlzdA==", "consumerExchange": "alice"})
        );
    }

    #[test]
    fn broadcast_body() {
        let body = SendAdMessageRequest { text: "cHJvbW8=", business_exchange: "acme" };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"text": "cHJvbW8=", "businessExchange": "acme"})
        );
    }

    #[test]
    fn key_bundle_without_username() {
        let response: ConsumerKeysResponse = serde_json::from_value(json!({
            "ik": "aWs=",
            "opk": "3:b3Br",
            "regID": 7,
            "spk": "c3Br",
            "spkID": "1",
            "spkSignature": "c2ln",
            "pqSpk": "cHE=",
            "pqSpkID": "2",
            "pqSpkSignature": "c2ln"
        }))
        .unwrap();

        assert!(response.username.is_empty());
        assert_eq!(response.reg_id, 7);
        assert_eq!(response.pq_spk_id, "2");
    }
}
