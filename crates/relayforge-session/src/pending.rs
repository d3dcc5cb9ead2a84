//! Outstanding calls of one session, keyed by request id.

use std::collections::HashMap;

use relayforge_protocol::{Codec, MessageType, RequestId, SessionId};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use crate::{Outcome, Promise, SessionError};

/// A successful reply to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: RequestId,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Response {
    /// Decodes the payload into a typed value.
    ///
    /// # Errors
    /// [`SessionError::Decode`] when the payload doesn't fit `T`.
    pub fn decode<T: DeserializeOwned>(&self, codec: &impl Codec) -> Result<T, SessionError> {
        Ok(codec.decode(&self.payload)?)
    }
}

/// A call waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    pub request_id: RequestId,
    pub message_type: MessageType,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub promise: Promise<Response>,
}

/// Request id → pending call, for one session.
///
/// Every entry leaves the table exactly once: by a matching response, by
/// the sweep (timeout or cancellation), or by [`fail_all`](Self::fail_all)
/// when the session closes. Whichever comes first resolves the promise;
/// anything arriving later finds no entry and is reported as stale.
#[derive(Debug)]
pub struct PendingCallTable {
    session_id: SessionId,
    calls: HashMap<RequestId, PendingCall>,
}

impl PendingCallTable {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            calls: HashMap::new(),
        }
    }

    /// Registers a call. Hands it back if the request id is already taken.
    pub fn insert(&mut self, call: PendingCall) -> Result<(), PendingCall> {
        if self.calls.contains_key(&call.request_id) {
            return Err(call);
        }
        self.calls.insert(call.request_id, call);
        Ok(())
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.calls.contains_key(&request_id)
    }

    /// Removes a call without resolving it.
    pub fn remove(&mut self, request_id: RequestId) -> Option<PendingCall> {
        self.calls.remove(&request_id)
    }

    /// Resolves the call for `request_id` with `outcome`.
    ///
    /// Returns `false` when no such call is outstanding: it already timed
    /// out, was cancelled, or never existed.
    pub fn resolve(&mut self, request_id: RequestId, outcome: Outcome<Response>) -> bool {
        match self.calls.remove(&request_id) {
            Some(call) => {
                call.promise.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Expires calls whose deadline is at or before `now` and drops calls
    /// whose futures were cancelled. Returns the ids that timed out.
    pub fn sweep(&mut self, now: Instant) -> Vec<RequestId> {
        let due: Vec<RequestId> = self
            .calls
            .values()
            .filter(|call| call.deadline <= now || call.promise.is_cancelled())
            .map(|call| call.request_id)
            .collect();

        let mut expired = Vec::new();
        for request_id in due {
            let Some(call) = self.calls.remove(&request_id) else {
                continue;
            };
            if call.promise.is_cancelled() {
                debug!(session = %self.session_id, request = %request_id, "dropping cancelled call");
                continue;
            }
            call.promise.fail(SessionError::Timeout {
                session_id: self.session_id,
                request_id,
                after: call.deadline.saturating_duration_since(call.issued_at),
            });
            expired.push(request_id);
        }
        expired.sort_unstable();
        expired
    }

    /// Fails every outstanding call with `err`. Returns how many.
    pub fn fail_all(&mut self, err: SessionError) -> usize {
        let n = self.calls.len();
        for (_, call) in self.calls.drain() {
            call.promise.fail(err.clone());
        }
        n
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Earliest deadline among outstanding calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|call| call.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{RpcFuture, promise};

    fn call(id: u64, issued_at: Instant, timeout_ms: u64) -> (PendingCall, RpcFuture<Response>) {
        let (promise, future) = promise(None);
        let call = PendingCall {
            request_id: RequestId(id),
            message_type: MessageType(1),
            issued_at,
            deadline: issued_at + Duration::from_millis(timeout_ms),
            promise,
        };
        (call, future)
    }

    fn response(id: u64) -> Response {
        Response {
            request_id: RequestId(id),
            message_type: MessageType(1),
            payload: b"ok".to_vec(),
        }
    }

    #[test]
    fn test_insert_duplicate_request_id_is_refused() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(1));
        let (a, _fa) = call(5, now, 50);
        let (b, _fb) = call(5, now, 50);
        assert!(table.insert(a).is_ok());
        assert!(table.insert(b).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_completes_future_once() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(1));
        let (c, future) = call(5, now, 50);
        table.insert(c).unwrap();

        assert!(table.resolve(RequestId(5), Ok(response(5))));
        assert_eq!(future.try_outcome(), Some(Ok(response(5))));
        assert!(!table.resolve(RequestId(5), Ok(response(5))), "second response is stale");
    }

    #[test]
    fn test_sweep_times_out_only_at_or_after_deadline() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(2));
        let (c, future) = call(7, now, 50);
        table.insert(c).unwrap();

        assert!(table.sweep(now + Duration::from_millis(49)).is_empty());
        assert!(!future.is_done());

        assert_eq!(table.sweep(now + Duration::from_millis(50)), vec![RequestId(7)]);
        assert_eq!(
            future.try_outcome(),
            Some(Err(SessionError::Timeout {
                session_id: SessionId(2),
                request_id: RequestId(7),
                after: Duration::from_millis(50),
            }))
        );
        assert!(!table.resolve(RequestId(7), Ok(response(7))), "late response is stale");
    }

    #[test]
    fn test_sweep_drops_cancelled_calls_without_timeout() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(1));
        let (c, future) = call(3, now, 10_000);
        table.insert(c).unwrap();
        future.cancel();

        assert!(table.sweep(now).is_empty());
        assert!(table.is_empty());
        assert_eq!(future.try_outcome(), Some(Err(SessionError::Cancelled)));
    }

    #[test]
    fn test_fail_all_resolves_every_call() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(4));
        let (a, fa) = call(1, now, 50);
        let (b, fb) = call(2, now, 50);
        table.insert(a).unwrap();
        table.insert(b).unwrap();

        assert_eq!(table.fail_all(SessionError::SessionClosed(SessionId(4))), 2);
        assert!(table.is_empty());
        for f in [fa, fb] {
            assert_eq!(
                f.try_outcome(),
                Some(Err(SessionError::SessionClosed(SessionId(4))))
            );
        }
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let now = Instant::now();
        let mut table = PendingCallTable::new(SessionId(1));
        let (a, _fa) = call(1, now, 80);
        let (b, _fb) = call(2, now, 30);
        table.insert(a).unwrap();
        table.insert(b).unwrap();
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(30)));
    }
}
