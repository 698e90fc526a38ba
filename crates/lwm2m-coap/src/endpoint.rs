//! Sans-IO CoAP endpoint
//!
//! Owns message ids, tokens, confirmable retransmission and duplicate
//! detection for one peer. The caller feeds received datagrams into
//! [`Endpoint::handle`], drives timers with [`Endpoint::poll`] and sends
//! whatever bytes come back. Nothing here touches a socket, so the state
//! machine is testable with a paused clock.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::message::{Code, Message, MessageType};

/// Transmission parameters (RFC 7252 section 4.8)
#[derive(Debug, Clone)]
pub struct TransmissionParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// How long a message id stays in the duplicate cache, and how long a
    /// separate response may take after an empty ACK
    pub exchange_lifetime: Duration,
    /// How long to wait for a response to a non-confirmable request
    pub non_lifetime: Duration,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// Bytes the caller must put on the wire
    Transmit(Vec<u8>),
    /// New inbound request, answer with [`Endpoint::respond`]
    Request(Message),
    /// Response to an earlier [`Endpoint::send_request`]
    Response { id: RequestId, message: Message },
    /// Request gave up without a response
    Failed { id: RequestId, error: TransportError },
    /// Peer reset a message that was not a request (a notification)
    Reset { token: Vec<u8> },
    /// Confirmable notification was never acknowledged
    Undelivered { token: Vec<u8> },
}

struct Outstanding {
    bytes: Vec<u8>,
    attempts: u32,
    timeout: Duration,
    deadline: Instant,
    request: Option<RequestId>,
    token: Vec<u8>,
}

struct Awaiting {
    id: RequestId,
    /// Set once no retransmission covers the exchange any more
    deadline: Option<Instant>,
}

struct Seen {
    expires: Instant,
    response: Option<Vec<u8>>,
}

pub struct Endpoint {
    params: TransmissionParams,
    rng: StdRng,
    next_mid: u16,
    next_request: u64,
    outstanding: BTreeMap<u16, Outstanding>,
    awaiting: BTreeMap<Vec<u8>, Awaiting>,
    seen: BTreeMap<u16, Seen>,
}

impl Endpoint {
    pub fn new(params: TransmissionParams) -> Self {
        let mut rng = StdRng::from_entropy();
        let next_mid = rng.gen();
        Self {
            params,
            rng,
            next_mid,
            next_request: 1,
            outstanding: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            seen: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &TransmissionParams {
        &self.params
    }

    /// Forget every exchange, used when the session is re-established
    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.awaiting.clear();
        self.seen.clear();
    }

    pub fn pending_requests(&self) -> usize {
        self.awaiting.len()
    }

    fn allocate_mid(&mut self) -> u16 {
        let mid = self.next_mid;
        self.next_mid = self.next_mid.wrapping_add(1);
        mid
    }

    fn initial_timeout(&mut self) -> Duration {
        let factor = self.params.ack_random_factor;
        if factor <= 1.0 {
            self.params.ack_timeout
        } else {
            self.params
                .ack_timeout
                .mul_f64(self.rng.gen_range(1.0..factor))
        }
    }

    pub fn new_token(&mut self) -> Vec<u8> {
        self.rng.gen::<u64>().to_be_bytes().to_vec()
    }

    fn track(&mut self, mid: u16, bytes: Vec<u8>, request: Option<RequestId>, token: Vec<u8>, now: Instant) {
        let timeout = self.initial_timeout();
        self.outstanding.insert(
            mid,
            Outstanding {
                bytes,
                attempts: 0,
                timeout,
                deadline: now + timeout,
                request,
                token,
            },
        );
    }

    /// Queue a request; the returned bytes must be transmitted by the caller
    pub fn send_request(&mut self, mut message: Message, now: Instant) -> (RequestId, Vec<u8>) {
        message.message_id = self.allocate_mid();
        if message.token.is_empty() {
            message.token = self.new_token();
        }
        let id = RequestId(self.next_request);
        self.next_request += 1;

        let bytes = message.encode();
        let deadline = if message.is_confirmable() {
            self.track(
                message.message_id,
                bytes.clone(),
                Some(id),
                message.token.clone(),
                now,
            );
            None
        } else {
            Some(now + self.params.non_lifetime)
        };
        self.awaiting
            .insert(message.token.clone(), Awaiting { id, deadline });
        trace!(%id, mid = message.message_id, code = %message.code, "Request queued");
        (id, bytes)
    }

    /// Send a message that expects no response, such as a notification
    ///
    /// Confirmable messages are retransmitted until acknowledged.
    pub fn send_message(&mut self, mut message: Message, now: Instant) -> Vec<u8> {
        message.message_id = self.allocate_mid();
        let bytes = message.encode();
        if message.is_confirmable() {
            self.track(
                message.message_id,
                bytes.clone(),
                None,
                message.token.clone(),
                now,
            );
        }
        bytes
    }

    /// Encode the response to `request`, piggybacked on the ACK when the
    /// request was confirmable, and remember it for duplicates
    pub fn respond(&mut self, request: &Message, mut response: Message, now: Instant) -> Vec<u8> {
        response.token = request.token.clone();
        if request.is_confirmable() {
            response.mtype = MessageType::Acknowledgement;
            response.message_id = request.message_id;
        } else {
            response.mtype = MessageType::NonConfirmable;
            response.message_id = self.allocate_mid();
        }
        let bytes = response.encode();
        let expires = now + self.params.exchange_lifetime;
        self.seen.insert(
            request.message_id,
            Seen {
                expires,
                response: Some(bytes.clone()),
            },
        );
        bytes
    }

    /// Process one received datagram
    pub fn handle(&mut self, datagram: &[u8], now: Instant) -> Vec<EndpointEvent> {
        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Dropping malformed datagram");
                return Vec::new();
            }
        };
        self.purge_seen(now);

        match message.mtype {
            MessageType::Acknowledgement => self.handle_ack(message, now),
            MessageType::Reset => self.handle_reset(message),
            MessageType::Confirmable | MessageType::NonConfirmable => {
                if message.code.is_request() {
                    self.handle_request(message, now)
                } else if message.code.is_empty() {
                    if message.is_confirmable() {
                        // CoAP ping
                        vec![EndpointEvent::Transmit(
                            Message::reset(message.message_id).encode(),
                        )]
                    } else {
                        Vec::new()
                    }
                } else {
                    self.handle_separate_response(message, now)
                }
            }
        }
    }

    fn handle_ack(&mut self, message: Message, now: Instant) -> Vec<EndpointEvent> {
        let Some(entry) = self.outstanding.remove(&message.message_id) else {
            trace!(mid = message.message_id, "Ignoring unmatched ACK");
            return Vec::new();
        };

        if message.code.is_empty() {
            if let Some(awaiting) = self.awaiting.get_mut(&entry.token) {
                awaiting.deadline = Some(now + self.params.exchange_lifetime);
            }
            return Vec::new();
        }

        if message.token != entry.token {
            warn!(mid = message.message_id, "ACK token does not match request");
            return Vec::new();
        }
        match self.awaiting.remove(&message.token) {
            Some(awaiting) => vec![EndpointEvent::Response {
                id: awaiting.id,
                message,
            }],
            None => Vec::new(),
        }
    }

    fn handle_reset(&mut self, message: Message) -> Vec<EndpointEvent> {
        let Some(entry) = self.outstanding.remove(&message.message_id) else {
            return Vec::new();
        };
        match entry.request {
            Some(id) => {
                self.awaiting.remove(&entry.token);
                vec![EndpointEvent::Failed {
                    id,
                    error: TransportError::Reset,
                }]
            }
            None => vec![EndpointEvent::Reset { token: entry.token }],
        }
    }

    fn handle_request(&mut self, message: Message, now: Instant) -> Vec<EndpointEvent> {
        if let Some(seen) = self.seen.get(&message.message_id) {
            debug!(mid = message.message_id, "Duplicate request");
            return match &seen.response {
                Some(bytes) => vec![EndpointEvent::Transmit(bytes.clone())],
                None => Vec::new(),
            };
        }
        self.seen.insert(
            message.message_id,
            Seen {
                expires: now + self.params.exchange_lifetime,
                response: None,
            },
        );
        vec![EndpointEvent::Request(message)]
    }

    fn handle_separate_response(&mut self, message: Message, now: Instant) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        let duplicate = self.seen.contains_key(&message.message_id);
        let known = self.awaiting.contains_key(&message.token);

        if message.is_confirmable() {
            if known || duplicate {
                events.push(EndpointEvent::Transmit(
                    Message::empty_ack(message.message_id).encode(),
                ));
            } else {
                events.push(EndpointEvent::Transmit(
                    Message::reset(message.message_id).encode(),
                ));
                return events;
            }
        }
        if duplicate {
            return events;
        }
        self.seen.insert(
            message.message_id,
            Seen {
                expires: now + self.params.exchange_lifetime,
                response: None,
            },
        );

        if let Some(awaiting) = self.awaiting.remove(&message.token) {
            // The response may overtake a lost ACK
            self.outstanding.retain(|_, o| o.token != message.token);
            events.push(EndpointEvent::Response {
                id: awaiting.id,
                message,
            });
        }
        events
    }

    fn purge_seen(&mut self, now: Instant) {
        self.seen.retain(|_, s| s.expires > now);
    }

    /// Fire due retransmissions and timeouts
    pub fn poll(&mut self, now: Instant) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        let due: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(mid, _)| *mid)
            .collect();

        for mid in due {
            let max = self.params.max_retransmit;
            let Some(entry) = self.outstanding.get_mut(&mid) else {
                continue;
            };
            if entry.attempts < max {
                entry.attempts += 1;
                entry.timeout *= 2;
                entry.deadline = now + entry.timeout;
                debug!(mid, attempt = entry.attempts, "Retransmitting");
                events.push(EndpointEvent::Transmit(entry.bytes.clone()));
                continue;
            }
            if let Some(entry) = self.outstanding.remove(&mid) {
                match entry.request {
                    Some(id) => {
                        self.awaiting.remove(&entry.token);
                        events.push(EndpointEvent::Failed {
                            id,
                            error: TransportError::Timeout(format!(
                                "no acknowledgement after {} retransmissions",
                                max
                            )),
                        });
                    }
                    None => events.push(EndpointEvent::Undelivered { token: entry.token }),
                }
            }
        }

        let expired: Vec<Vec<u8>> = self
            .awaiting
            .iter()
            .filter(|(_, a)| a.deadline.is_some_and(|d| d <= now))
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(awaiting) = self.awaiting.remove(&token) {
                events.push(EndpointEvent::Failed {
                    id: awaiting.id,
                    error: TransportError::Timeout("no response".into()),
                });
            }
        }

        self.purge_seen(now);
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let retransmit = self.outstanding.values().map(|o| o.deadline);
        let exchange = self.awaiting.values().filter_map(|a| a.deadline);
        retransmit.chain(exchange).min()
    }

    /// Abandon a request; a late response is then ignored
    pub fn cancel(&mut self, id: RequestId) {
        let token = self
            .awaiting
            .iter()
            .find(|(_, a)| a.id == id)
            .map(|(t, _)| t.clone());
        if let Some(token) = token {
            self.cancel_token(&token);
        }
    }

    /// Stop retransmitting anything carrying `token`
    pub fn cancel_token(&mut self, token: &[u8]) {
        self.awaiting.remove(token);
        self.outstanding.retain(|_, o| o.token != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentFormat;
    use pretty_assertions::assert_eq;

    fn endpoint() -> Endpoint {
        Endpoint::new(TransmissionParams {
            ack_random_factor: 1.0,
            ..Default::default()
        })
    }

    fn transmits(events: &[EndpointEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, EndpointEvent::Transmit(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_piggybacked_response() {
        let mut ep = endpoint();
        let now = Instant::now();
        let (id, bytes) = ep.send_request(Message::request(Code::POST, "rd"), now);
        let sent = Message::decode(&bytes).unwrap();

        let mut ack = Message::response(&sent, Code::CREATED);
        ack.add_option(crate::message::option::LOCATION_PATH, b"rd".to_vec());
        let events = ep.handle(&ack.encode(), now);
        match &events[..] {
            [EndpointEvent::Response { id: got, message }] => {
                assert_eq!(*got, id);
                assert_eq!(message.code, Code::CREATED);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ep.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_backoff_and_failure() {
        let mut ep = endpoint();
        let start = Instant::now();
        let (id, _) = ep.send_request(Message::request(Code::POST, "rd"), start);

        // Deadlines at 2, 6, 14, 30 then failure at 62 seconds
        let mut retransmits = 0;
        for secs in [2u64, 6, 14, 30] {
            assert_eq!(ep.next_deadline(), Some(start + Duration::from_secs(secs)));
            let events = ep.poll(start + Duration::from_secs(secs));
            retransmits += transmits(&events);
        }
        assert_eq!(retransmits, 4);
        assert!(ep.poll(start + Duration::from_secs(61)).is_empty());
        let events = ep.poll(start + Duration::from_secs(62));
        assert!(matches!(
            &events[..],
            [EndpointEvent::Failed { id: got, error: TransportError::Timeout(_) }] if *got == id
        ));
        assert!(ep.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_response() {
        let mut ep = endpoint();
        let now = Instant::now();
        let (id, bytes) = ep.send_request(Message::request(Code::GET, "fw"), now);
        let sent = Message::decode(&bytes).unwrap();

        assert!(ep.handle(&Message::empty_ack(sent.message_id).encode(), now).is_empty());
        // Exchange deadline replaces the retransmit deadline
        assert_eq!(ep.next_deadline(), Some(now + Duration::from_secs(247)));
        assert_eq!(transmits(&ep.poll(now + Duration::from_secs(10))), 0);

        let mut separate = Message::new(MessageType::Confirmable, Code::CONTENT);
        separate.message_id = 0x4242;
        separate.token = sent.token.clone();
        separate.set_content_format(ContentFormat::OPAQUE);
        separate.payload = vec![1, 2, 3];
        let events = ep.handle(&separate.encode(), now);
        assert_eq!(events.len(), 2);
        let ack = match &events[0] {
            EndpointEvent::Transmit(b) => Message::decode(b).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ack.mtype, MessageType::Acknowledgement);
        assert_eq!(ack.message_id, 0x4242);
        assert!(matches!(&events[1], EndpointEvent::Response { id: got, .. } if *got == id));

        // A retransmitted copy is acknowledged again but not delivered twice
        let events = ep.handle(&separate.encode(), now);
        assert_eq!(events.len(), 1);
        assert_eq!(transmits(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_replays_response() {
        let mut ep = endpoint();
        let now = Instant::now();
        let mut req = Message::request(Code::GET, "3/0/0");
        req.message_id = 99;
        req.token = vec![7];
        let events = ep.handle(&req.encode(), now);
        assert!(matches!(&events[..], [EndpointEvent::Request(_)]));

        let mut resp = Message::response(&req, Code::CONTENT);
        resp.payload = b"acme".to_vec();
        let first = ep.respond(&req, resp, now);

        let events = ep.handle(&req.encode(), now + Duration::from_secs(3));
        assert_eq!(events, vec![EndpointEvent::Transmit(first)]);

        // After the exchange lifetime the id is fresh again
        let events = ep.handle(&req.encode(), now + Duration::from_secs(300));
        assert!(matches!(&events[..], [EndpointEvent::Request(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_reset_and_undelivered() {
        let mut ep = endpoint();
        let now = Instant::now();
        let mut notify = Message::new(MessageType::Confirmable, Code::CONTENT);
        notify.token = vec![0xAB];
        let bytes = ep.send_message(notify, now);
        let sent = Message::decode(&bytes).unwrap();

        let events = ep.handle(&Message::reset(sent.message_id).encode(), now);
        assert_eq!(events, vec![EndpointEvent::Reset { token: vec![0xAB] }]);

        let mut notify = Message::new(MessageType::Confirmable, Code::CONTENT);
        notify.token = vec![0xCD];
        ep.send_message(notify, now);
        let mut last = Vec::new();
        for secs in [2u64, 6, 14, 30, 62] {
            last = ep.poll(now + Duration::from_secs(secs));
        }
        assert_eq!(last, vec![EndpointEvent::Undelivered { token: vec![0xCD] }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_gets_reset() {
        let mut ep = endpoint();
        let mut ping = Message::new(MessageType::Confirmable, Code::EMPTY);
        ping.message_id = 5;
        let events = ep.handle(&ping.encode(), Instant::now());
        let rst = match &events[..] {
            [EndpointEvent::Transmit(b)] => Message::decode(b).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rst.mtype, MessageType::Reset);
        assert_eq!(rst.message_id, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retransmission() {
        let mut ep = endpoint();
        let now = Instant::now();
        let (id, _) = ep.send_request(Message::request(Code::POST, "rd/1"), now);
        ep.cancel(id);
        assert!(ep.poll(now + Duration::from_secs(100)).is_empty());
        assert_eq!(ep.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_request_times_out() {
        let mut ep = endpoint();
        let now = Instant::now();
        let mut msg = Message::request(Code::GET, "x");
        msg.mtype = MessageType::NonConfirmable;
        let (id, _) = ep.send_request(msg, now);
        let events = ep.poll(now + Duration::from_secs(145));
        assert!(matches!(&events[..], [EndpointEvent::Failed { id: got, .. }] if *got == id));
    }
}
