//! CBOR encoding of envelopes and messages.

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serializable value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    if bytes.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

/// Types that can be encoded to CBOR.
pub trait Encode {
    /// Encode this value to CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for RequestEnvelope {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl Decode for RequestEnvelope {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

impl Encode for ResponseEnvelope {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl Decode for ResponseEnvelope {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CollectionData, Data, IdentityData, ObjectData};
    use crate::messages::{
        AuthenticationSession, ClientActionType, ExecuteClientActionRequest, Request, Response,
        ServerFault, FaultKind,
    };
    use crate::oid::Oid;
    use crate::version::Version;
    use uuid::Uuid;

    #[test]
    fn client_action_envelope_survives_the_wire() {
        let customer = Oid::persistent("Customer#1");
        let order = Oid::transient();
        let graph = ObjectData::complete(
            order.clone(),
            "Order",
            None,
            vec![
                Data::value("Int", "42"),
                Data::Identity(IdentityData::new(
                    customer,
                    "Customer",
                    Some(Version::new(3, "bob", 17)),
                )),
                Data::Collection(CollectionData::with_elements(
                    Oid::persistent("x/lines"),
                    "Line",
                    None,
                    vec![Data::null("Line")],
                )),
            ],
        );
        let envelope = RequestEnvelope {
            id: 12,
            request: Request::ExecuteClientAction(ExecuteClientActionRequest {
                session: AuthenticationSession {
                    id: Uuid::new_v4(),
                    user: "alice".into(),
                    roles: vec![],
                    token: vec![9; 32],
                },
                data: vec![Data::Object(graph)],
                types: vec![ClientActionType::Add],
            }),
        };

        let bytes = envelope.encode().unwrap();
        let decoded = RequestEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);

        match decoded.request {
            Request::ExecuteClientAction(req) => {
                assert_eq!(req.data[0].oid(), Some(&order));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn fault_response_decodes() {
        let envelope = ResponseEnvelope {
            id: 4,
            response: Response::Fault(ServerFault::new(FaultKind::Internal, "boom")),
        };
        let decoded = ResponseEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            RequestEnvelope::decode(&[]),
            Err(CodecError::UnexpectedEof)
        ));
        assert!(matches!(
            ResponseEnvelope::decode(&[0xff, 0x00, 0x13]),
            Err(CodecError::DecodingFailed { .. })
        ));
    }
}
