//! Sequence-correlated envelopes.
//!
//! Every request leaves the client wrapped in a [`RequestEnvelope`] carrying
//! a strictly increasing id; the server answers with a [`ResponseEnvelope`]
//! echoing it. A session allows one outstanding request at a time and the
//! [`Correlator`] refuses any response that does not answer it.

use crate::error::{FacadeError, FacadeResult};
use crate::messages::{Request, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A request bound to its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id.
    pub id: u64,
    /// The request.
    pub request: Request,
}

/// A response bound to the id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the answered request.
    pub id: u64,
    /// The response.
    pub response: Response,
}

impl ResponseEnvelope {
    /// Answers `request`.
    pub fn answer(request: &RequestEnvelope, response: Response) -> Self {
        Self {
            id: request.id,
            response,
        }
    }
}

/// Correlation state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    /// No request outstanding.
    Idle,
    /// Waiting for the response to the given id.
    Awaiting(u64),
}

/// Per-session request/response correlation.
///
/// Transitions: `Idle -> Awaiting(id)` on [`begin`](Self::begin), back to
/// `Idle` on [`complete`](Self::complete) whether or not the id matched, and
/// on [`abandon`](Self::abandon) after a transport failure. Ids are never
/// reused, so a late or duplicated response can never match a later request.
#[derive(Debug)]
pub struct Correlator {
    next_id: u64,
    state: CorrelationState,
}

impl Correlator {
    /// Creates a correlator whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a correlator whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_id: first,
            state: CorrelationState::Idle,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CorrelationState {
        self.state
    }

    /// Wraps `request` in an envelope with the next id.
    pub fn begin(&mut self, request: Request) -> FacadeResult<RequestEnvelope> {
        if let CorrelationState::Awaiting(outstanding) = self.state {
            return Err(FacadeError::RequestInFlight { outstanding });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.state = CorrelationState::Awaiting(id);
        Ok(RequestEnvelope { id, request })
    }

    /// Accepts `envelope` if it answers the outstanding request.
    pub fn complete(&mut self, envelope: ResponseEnvelope) -> FacadeResult<Response> {
        let expected = match self.state {
            CorrelationState::Awaiting(id) => id,
            CorrelationState::Idle => {
                warn!(actual = envelope.id, "response with no request outstanding");
                return Err(FacadeError::Unsolicited {
                    actual: envelope.id,
                });
            }
        };
        self.state = CorrelationState::Idle;

        if envelope.id != expected {
            warn!(expected, actual = envelope.id, "response out of sequence");
            return Err(FacadeError::OutOfSequence {
                expected,
                actual: envelope.id,
            });
        }
        Ok(envelope.response)
    }

    /// Drops the outstanding request after the exchange failed.
    pub fn abandon(&mut self) {
        self.state = CorrelationState::Idle;
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CloseSessionResponse, OpenSessionRequest};
    use proptest::prelude::*;

    fn open() -> Request {
        Request::OpenSession(OpenSessionRequest {
            user: "u".into(),
            password: "p".into(),
        })
    }

    fn reply(id: u64) -> ResponseEnvelope {
        ResponseEnvelope {
            id,
            response: Response::CloseSession(CloseSessionResponse {}),
        }
    }

    #[test]
    fn ids_increase_strictly() {
        let mut correlator = Correlator::new();
        let first = correlator.begin(open()).unwrap();
        correlator.complete(reply(first.id)).unwrap();
        let second = correlator.begin(open()).unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
    }

    #[test]
    fn second_request_while_awaiting_is_refused() {
        let mut correlator = Correlator::new();
        let first = correlator.begin(open()).unwrap();

        let err = correlator.begin(open()).unwrap_err();
        assert_eq!(
            err,
            FacadeError::RequestInFlight {
                outstanding: first.id
            }
        );
    }

    #[test]
    fn mismatched_response_is_fatal_and_resets() {
        let mut correlator = Correlator::new();
        let envelope = correlator.begin(open()).unwrap();

        let err = correlator.complete(reply(envelope.id + 7)).unwrap_err();
        assert!(matches!(err, FacadeError::OutOfSequence { expected, .. } if expected == envelope.id));
        assert_eq!(correlator.state(), CorrelationState::Idle);

        // The late original response can never match the next request.
        let next = correlator.begin(open()).unwrap();
        assert!(correlator.complete(reply(envelope.id)).is_err());
        assert_ne!(next.id, envelope.id);
    }

    #[test]
    fn unsolicited_response_is_refused() {
        let mut correlator = Correlator::new();
        assert!(matches!(
            correlator.complete(reply(1)),
            Err(FacadeError::Unsolicited { actual: 1 })
        ));
    }

    #[test]
    fn abandon_allows_next_request() {
        let mut correlator = Correlator::new();
        correlator.begin(open()).unwrap();
        correlator.abandon();
        assert!(correlator.begin(open()).is_ok());
    }

    proptest! {
        #[test]
        fn only_matching_envelopes_are_accepted(offsets in proptest::collection::vec(0u64..4, 1..40)) {
            let mut correlator = Correlator::new();
            for offset in offsets {
                let envelope = correlator.begin(open()).unwrap();
                let answered = envelope.id + offset;
                let outcome = correlator.complete(reply(answered));
                prop_assert_eq!(outcome.is_ok(), offset == 0);
                prop_assert_eq!(correlator.state(), CorrelationState::Idle);
            }
        }
    }
}
