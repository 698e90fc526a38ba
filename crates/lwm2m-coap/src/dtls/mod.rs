//! DTLS 1.2 client with pre-shared keys
//!
//! Supports the single cipher suite LwM2M mandates for PSK mode,
//! `TLS_PSK_WITH_AES_128_CCM_8`. The handshake runs once in
//! [`DtlsTransport::connect`]; afterwards the transport seals and opens
//! application data records and drops anything that fails authentication
//! or the replay window.

pub mod crypto;
pub mod handshake;
pub mod record;

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::endpoint::TransmissionParams;
use crate::error::TransportError;
use crate::transport::DatagramTransport;

use crypto::{CipherState, RANDOM_LEN};
use handshake::{
    Handshake, ServerHello, CLIENT_HELLO, CLIENT_KEY_EXCHANGE, FINISHED, HELLO_VERIFY_REQUEST,
    SERVER_HELLO, SERVER_HELLO_DONE, SERVER_KEY_EXCHANGE, TLS_PSK_WITH_AES_128_CCM_8,
};
use record::{ReplayWindow, ALERT, APPLICATION_DATA, CHANGE_CIPHER_SPEC, HANDSHAKE, MAX_SEQUENCE};

const ALERT_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;

struct Session {
    write_seq: u64,
    replay: ReplayWindow,
    pending: VecDeque<Vec<u8>>,
}

pub struct DtlsTransport {
    inner: Box<dyn DatagramTransport>,
    write: CipherState,
    read: CipherState,
    session: Mutex<Session>,
}

impl DtlsTransport {
    /// Run the PSK handshake over `inner`
    pub async fn connect(
        inner: Box<dyn DatagramTransport>,
        identity: &[u8],
        psk: &[u8],
        params: &TransmissionParams,
    ) -> Result<Self, TransportError> {
        let mut client_random = [0u8; RANDOM_LEN];
        rand::thread_rng().fill(&mut client_random[..]);

        let established = {
            let mut hs = Handshaker::new(inner.as_ref(), identity, psk, client_random, params);
            hs.run().await?
        };
        info!(peer = ?inner.peer(), "DTLS session established");

        let mut replay = ReplayWindow::default();
        replay.update(established.server_finished_seq);
        Ok(Self {
            inner,
            write: established.write,
            read: established.read,
            session: Mutex::new(Session {
                write_seq: established.next_write_seq,
                replay,
                pending: VecDeque::new(),
            }),
        })
    }

    fn seal_record(&self, content_type: u8, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let seq = {
            let mut session = self.session.lock();
            if session.write_seq > MAX_SEQUENCE {
                return Err(TransportError::ConnectionClosed);
            }
            let seq = session.write_seq;
            session.write_seq += 1;
            seq
        };
        let fragment = self.write.seal(1, seq, content_type, plaintext)?;
        Ok(record::encode_record(content_type, 1, seq, &fragment))
    }

    /// Open every protected record in `datagram`, queueing application data
    fn absorb(&self, datagram: &[u8]) -> Result<(), TransportError> {
        let records = match record::parse_records(datagram) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Dropping malformed DTLS datagram");
                return Ok(());
            }
        };
        for rec in records {
            if rec.epoch != 1 {
                trace!(content_type = rec.content_type, "Ignoring epoch 0 record");
                continue;
            }
            if !self.session.lock().replay.check(rec.sequence) {
                debug!(seq = rec.sequence, "Dropping replayed record");
                continue;
            }
            let plaintext = match self
                .read
                .open(rec.epoch, rec.sequence, rec.content_type, rec.fragment)
            {
                Ok(p) => p,
                Err(_) => {
                    debug!(seq = rec.sequence, "Dropping record that failed authentication");
                    continue;
                }
            };
            let mut session = self.session.lock();
            session.replay.update(rec.sequence);
            match rec.content_type {
                APPLICATION_DATA => session.pending.push_back(plaintext),
                ALERT => {
                    let level = plaintext.first().copied().unwrap_or(ALERT_FATAL);
                    let desc = plaintext.get(1).copied().unwrap_or(0);
                    if level == ALERT_FATAL || desc == ALERT_CLOSE_NOTIFY {
                        warn!(level, desc, "DTLS session closed by peer");
                        return Err(TransportError::ConnectionClosed);
                    }
                    debug!(level, desc, "DTLS warning alert");
                }
                // Retransmitted final flight from the server
                HANDSHAKE | CHANGE_CIPHER_SPEC => {}
                other => debug!(content_type = other, "Ignoring unknown record type"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DatagramTransport for DtlsTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        let rec = self.seal_record(APPLICATION_DATA, datagram)?;
        self.inner.send(&rec).await
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(p) = self.session.lock().pending.pop_front() {
                return Ok(p);
            }
            let datagram = self.inner.recv().await?;
            self.absorb(&datagram)?;
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer()
    }

    fn is_secure(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), TransportError> {
        let rec = self.seal_record(ALERT, &[1, ALERT_CLOSE_NOTIFY])?;
        self.inner.send(&rec).await
    }
}

// =============================================================================
// Handshake
// =============================================================================

struct Established {
    write: CipherState,
    read: CipherState,
    next_write_seq: u64,
    server_finished_seq: u64,
}

/// One record to put in an outbound flight
struct Outbound {
    content_type: u8,
    epoch: u16,
    body: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// HelloVerifyRequest, or the server flight if the server skips it
    Hello,
    ServerHelloDone,
    ServerFinished,
}

struct Handshaker<'a> {
    inner: &'a dyn DatagramTransport,
    identity: &'a [u8],
    psk: &'a [u8],
    client_random: [u8; RANDOM_LEN],
    initial_timeout: Duration,
    max_retransmit: u32,

    epoch0_seq: u64,
    epoch1_seq: u64,
    client_message_seq: u16,
    transcript: Vec<u8>,
    seen_server_messages: BTreeSet<u16>,

    cookie: Option<Vec<u8>>,
    server_hello: Option<ServerHello>,
    server_done: bool,
    master: Vec<u8>,
    write: Option<CipherState>,
    read: Option<CipherState>,
    expected_server_finished: Vec<u8>,
    server_finished_seq: Option<u64>,
}

impl<'a> Handshaker<'a> {
    fn new(
        inner: &'a dyn DatagramTransport,
        identity: &'a [u8],
        psk: &'a [u8],
        client_random: [u8; RANDOM_LEN],
        params: &TransmissionParams,
    ) -> Self {
        Self {
            inner,
            identity,
            psk,
            client_random,
            initial_timeout: params.ack_timeout,
            max_retransmit: params.max_retransmit,
            epoch0_seq: 0,
            epoch1_seq: 0,
            client_message_seq: 0,
            transcript: Vec::new(),
            seen_server_messages: BTreeSet::new(),
            cookie: None,
            server_hello: None,
            server_done: false,
            master: Vec::new(),
            write: None,
            read: None,
            expected_server_finished: Vec::new(),
            server_finished_seq: None,
        }
    }

    fn next_message(&mut self, msg_type: u8, body: &[u8]) -> Vec<u8> {
        let raw = handshake::encode_handshake(msg_type, self.client_message_seq, body);
        self.client_message_seq += 1;
        raw
    }

    async fn run(&mut self) -> Result<Established, TransportError> {
        let ch1 = self.next_message(CLIENT_HELLO, &handshake::client_hello(&self.client_random, &[]));
        let flight = [Outbound {
            content_type: HANDSHAKE,
            epoch: 0,
            body: ch1,
        }];
        self.exchange(&flight, Expect::Hello).await?;

        if let Some(cookie) = self.cookie.clone() {
            debug!(cookie_len = cookie.len(), "Received HelloVerifyRequest");
            let body = handshake::client_hello(&self.client_random, &cookie);
            let ch2 = self.next_message(CLIENT_HELLO, &body);
            self.transcript = ch2.clone();
            let flight = [Outbound {
                content_type: HANDSHAKE,
                epoch: 0,
                body: ch2,
            }];
            self.exchange(&flight, Expect::ServerHelloDone).await?;
        }

        let server_hello = self
            .server_hello
            .clone()
            .ok_or_else(|| TransportError::Handshake("no ServerHello".into()))?;

        let premaster = crypto::psk_premaster(self.psk);
        self.master = crypto::master_secret(&premaster, &self.client_random, &server_hello.random)?;
        let keys = crypto::key_block(&self.master, &self.client_random, &server_hello.random)?;
        self.write = Some(CipherState::new(&keys.client_key, &keys.client_iv));
        self.read = Some(CipherState::new(&keys.server_key, &keys.server_iv));

        let cke = self.next_message(
            CLIENT_KEY_EXCHANGE,
            &handshake::client_key_exchange(self.identity),
        );
        self.transcript.extend_from_slice(&cke);
        let client_verify = crypto::verify_data(&self.master, b"client finished", &self.transcript)?;
        let finished = self.next_message(FINISHED, &client_verify);
        self.transcript.extend_from_slice(&finished);
        self.expected_server_finished =
            crypto::verify_data(&self.master, b"server finished", &self.transcript)?;

        let flight = [
            Outbound {
                content_type: HANDSHAKE,
                epoch: 0,
                body: cke,
            },
            Outbound {
                content_type: CHANGE_CIPHER_SPEC,
                epoch: 0,
                body: vec![1],
            },
            Outbound {
                content_type: HANDSHAKE,
                epoch: 1,
                body: finished,
            },
        ];
        self.exchange(&flight, Expect::ServerFinished).await?;

        let (write, read) = match (self.write.take(), self.read.take()) {
            (Some(w), Some(r)) => (w, r),
            _ => return Err(TransportError::Handshake("cipher state missing".into())),
        };
        Ok(Established {
            write,
            read,
            next_write_seq: self.epoch1_seq,
            server_finished_seq: self.server_finished_seq.unwrap_or(0),
        })
    }

    fn build_flight(&mut self, flight: &[Outbound]) -> Result<Vec<u8>, TransportError> {
        let mut datagram = Vec::new();
        for out in flight {
            let rec = if out.epoch == 0 {
                let seq = self.epoch0_seq;
                self.epoch0_seq += 1;
                record::encode_record(out.content_type, 0, seq, &out.body)
            } else {
                let seq = self.epoch1_seq;
                self.epoch1_seq += 1;
                let cipher = self
                    .write
                    .as_ref()
                    .ok_or_else(|| TransportError::Handshake("epoch 1 without keys".into()))?;
                let fragment = cipher.seal(1, seq, out.content_type, &out.body)?;
                record::encode_record(out.content_type, 1, seq, &fragment)
            };
            datagram.extend_from_slice(&rec);
        }
        Ok(datagram)
    }

    /// Send `flight` and retransmit it until the server's answer is complete
    async fn exchange(&mut self, flight: &[Outbound], expect: Expect) -> Result<(), TransportError> {
        let mut wait = self.initial_timeout;
        for attempt in 0..=self.max_retransmit {
            if attempt > 0 {
                debug!(attempt, "Retransmitting handshake flight");
            }
            let datagram = self.build_flight(flight)?;
            self.inner.send(&datagram).await?;

            let deadline = Instant::now() + wait;
            loop {
                let received = match timeout_at(deadline, self.inner.recv()).await {
                    Ok(r) => r?,
                    Err(_) => break,
                };
                if self.process(&received, expect)? {
                    return Ok(());
                }
            }
            wait *= 2;
        }
        Err(TransportError::Timeout(
            "DTLS handshake: no answer from server".into(),
        ))
    }

    /// Handle one datagram from the server; true once `expect` is satisfied
    fn process(&mut self, datagram: &[u8], expect: Expect) -> Result<bool, TransportError> {
        let records = match record::parse_records(datagram) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed handshake datagram");
                return Ok(false);
            }
        };

        let mut done = false;
        for rec in records {
            match (rec.content_type, rec.epoch) {
                (ALERT, 0) => {
                    let desc = rec.fragment.get(1).copied().unwrap_or(0);
                    return Err(TransportError::Handshake(format!("server alert {}", desc)));
                }
                (HANDSHAKE, 0) => {
                    for msg in handshake::parse_handshakes(rec.fragment)? {
                        done |= self.server_message(&msg, expect)?;
                    }
                }
                (CHANGE_CIPHER_SPEC, 0) => trace!("Server ChangeCipherSpec"),
                (HANDSHAKE, 1) | (ALERT, 1) if expect == Expect::ServerFinished => {
                    let cipher = self
                        .read
                        .as_ref()
                        .ok_or_else(|| TransportError::Handshake("epoch 1 without keys".into()))?;
                    let plaintext = cipher
                        .open(1, rec.sequence, rec.content_type, rec.fragment)
                        .map_err(|_| {
                            TransportError::Handshake("server Finished failed to authenticate".into())
                        })?;
                    if rec.content_type == ALERT {
                        let desc = plaintext.get(1).copied().unwrap_or(0);
                        return Err(TransportError::Handshake(format!("server alert {}", desc)));
                    }
                    for msg in handshake::parse_handshakes(&plaintext)? {
                        if msg.msg_type != FINISHED {
                            continue;
                        }
                        if msg.body != self.expected_server_finished.as_slice() {
                            return Err(TransportError::Handshake(
                                "server Finished verify_data mismatch".into(),
                            ));
                        }
                        self.server_finished_seq = Some(rec.sequence);
                        done = true;
                    }
                }
                (content_type, epoch) => {
                    trace!(content_type, epoch, "Ignoring record during handshake")
                }
            }
        }
        Ok(done)
    }

    fn server_message(&mut self, msg: &Handshake<'_>, expect: Expect) -> Result<bool, TransportError> {
        if msg.msg_type == HELLO_VERIFY_REQUEST {
            if expect == Expect::Hello {
                self.cookie = Some(handshake::parse_hello_verify(msg.body)?);
                return Ok(true);
            }
            return Ok(false);
        }
        if expect == Expect::ServerFinished {
            // Retransmitted server hello flight
            return Ok(false);
        }
        if !self.seen_server_messages.insert(msg.message_seq) {
            return Ok(false);
        }
        if expect == Expect::Hello && self.transcript.is_empty() {
            // No HelloVerifyRequest, the first ClientHello is part of the transcript
            let ch1 = handshake::encode_handshake(
                CLIENT_HELLO,
                0,
                &handshake::client_hello(&self.client_random, &[]),
            );
            self.transcript = ch1;
        }

        match msg.msg_type {
            SERVER_HELLO => {
                let hello = handshake::parse_server_hello(msg.body)?;
                if hello.cipher_suite != TLS_PSK_WITH_AES_128_CCM_8 {
                    return Err(TransportError::Handshake(format!(
                        "server chose unsupported cipher suite {:#06X}",
                        hello.cipher_suite
                    )));
                }
                self.server_hello = Some(hello);
            }
            SERVER_KEY_EXCHANGE => {
                let hint = handshake::parse_psk_hint(msg.body)?;
                debug!(hint = %String::from_utf8_lossy(&hint), "PSK identity hint");
            }
            SERVER_HELLO_DONE => self.server_done = true,
            other => {
                return Err(TransportError::Handshake(format!(
                    "unexpected handshake message {}",
                    other
                )))
            }
        }
        self.transcript.extend_from_slice(msg.raw);
        Ok(self.server_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockPeer, MockTransport};
    use pretty_assertions::assert_eq;

    const PSK: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    struct ServerOptions {
        hello_verify: bool,
        psk: &'static [u8],
    }

    /// Minimal DTLS server side: handshake, then echo one record
    async fn run_server(mut peer: MockPeer, options: ServerOptions) -> Vec<u8> {
        let dg = peer.recv().await.unwrap();
        let recs = record::parse_records(&dg).unwrap();
        let ch1 = handshake::parse_handshakes(recs[0].fragment).unwrap()[0].clone();
        assert_eq!(ch1.msg_type, CLIENT_HELLO);

        let mut transcript = Vec::new();
        let client_random: Vec<u8>;
        let mut seq = 0u16;
        let mut rec_seq = 0u64;
        if options.hello_verify {
            let hvr = handshake::encode_handshake(HELLO_VERIFY_REQUEST, 0, &[0xFE, 0xFF, 2, 0xCA, 0xFE]);
            peer.send(record::encode_record(HANDSHAKE, 0, rec_seq, &hvr));
            rec_seq += 1;
            seq += 1;
            let dg = peer.recv().await.unwrap();
            let recs = record::parse_records(&dg).unwrap();
            let ch2 = handshake::parse_handshakes(recs[0].fragment).unwrap()[0].clone();
            assert_eq!(ch2.message_seq, 1);
            assert_eq!(&ch2.body[35..38], &[2, 0xCA, 0xFE]);
            transcript.extend_from_slice(ch2.raw);
            client_random = ch2.body[2..34].to_vec();
        } else {
            transcript.extend_from_slice(ch1.raw);
            client_random = ch1.body[2..34].to_vec();
        }

        let server_random = [0x5A; 32];
        let mut sh = vec![0xFE, 0xFD];
        sh.extend_from_slice(&server_random);
        sh.extend_from_slice(&[0, 0xC0, 0xA8, 0]);
        let mut flight = handshake::encode_handshake(SERVER_HELLO, seq, &sh);
        flight.extend(handshake::encode_handshake(SERVER_KEY_EXCHANGE, seq + 1, &[0, 3, b'h', b'u', b'b']));
        flight.extend(handshake::encode_handshake(SERVER_HELLO_DONE, seq + 2, &[]));
        transcript.extend_from_slice(&flight);
        peer.send(record::encode_record(HANDSHAKE, 0, rec_seq, &flight));
        rec_seq += 1;

        let dg = peer.recv().await.unwrap();
        let recs = record::parse_records(&dg).unwrap();
        assert_eq!(recs.len(), 3);
        let cke = handshake::parse_handshakes(recs[0].fragment).unwrap()[0].clone();
        assert_eq!(cke.msg_type, CLIENT_KEY_EXCHANGE);
        assert_eq!(cke.body, b"\x00\x08device-1");
        transcript.extend_from_slice(cke.raw);
        assert_eq!(recs[1].content_type, CHANGE_CIPHER_SPEC);
        assert_eq!(recs[2].epoch, 1);

        let master = crypto::master_secret(
            &crypto::psk_premaster(options.psk),
            &client_random,
            &server_random,
        )
        .unwrap();
        let keys = crypto::key_block(&master, &client_random, &server_random).unwrap();
        let from_client = CipherState::new(&keys.client_key, &keys.client_iv);
        let to_client = CipherState::new(&keys.server_key, &keys.server_iv);

        if options.psk == PSK {
            let fin = from_client
                .open(1, recs[2].sequence, HANDSHAKE, recs[2].fragment)
                .unwrap();
            let fin_msg = handshake::parse_handshakes(&fin).unwrap()[0].clone();
            let expected = crypto::verify_data(&master, b"client finished", &transcript).unwrap();
            assert_eq!(fin_msg.body, expected.as_slice());
            transcript.extend_from_slice(fin_msg.raw);
        }

        let server_verify = crypto::verify_data(&master, b"server finished", &transcript).unwrap();
        let server_fin = handshake::encode_handshake(FINISHED, seq + 3, &server_verify);
        let mut out = record::encode_record(CHANGE_CIPHER_SPEC, 0, rec_seq, &[1]);
        let sealed = to_client.seal(1, 0, HANDSHAKE, &server_fin).unwrap();
        out.extend(record::encode_record(HANDSHAKE, 1, 0, &sealed));
        peer.send(out);

        if options.psk != PSK {
            return Vec::new();
        }

        let dg = peer.recv().await.unwrap();
        let recs = record::parse_records(&dg).unwrap();
        assert_eq!(recs[0].content_type, APPLICATION_DATA);
        let app = from_client
            .open(1, recs[0].sequence, APPLICATION_DATA, recs[0].fragment)
            .unwrap();

        let echo = to_client.seal(1, 1, APPLICATION_DATA, &app).unwrap();
        let echo_record = record::encode_record(APPLICATION_DATA, 1, 1, &echo);
        peer.send(echo_record.clone());
        // Replayed copy must be dropped by the client
        peer.send(echo_record);
        let late = to_client.seal(1, 2, APPLICATION_DATA, b"second").unwrap();
        peer.send(record::encode_record(APPLICATION_DATA, 1, 2, &late));
        app
    }

    fn params() -> TransmissionParams {
        TransmissionParams {
            ack_timeout: Duration::from_secs(1),
            max_retransmit: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_with_cookie_and_echo() {
        let (transport, peer) = MockTransport::pair();
        let server = tokio::spawn(run_server(
            peer,
            ServerOptions {
                hello_verify: true,
                psk: PSK,
            },
        ));

        let dtls = DtlsTransport::connect(Box::new(transport), b"device-1", PSK, &params())
            .await
            .unwrap();
        assert!(dtls.is_secure());
        dtls.send(b"coap-bytes").await.unwrap();
        assert_eq!(dtls.recv().await.unwrap(), b"coap-bytes");
        // The replayed record is skipped, the next fresh one arrives
        assert_eq!(dtls.recv().await.unwrap(), b"second");
        assert_eq!(server.await.unwrap(), b"coap-bytes");
    }

    #[tokio::test]
    async fn test_handshake_without_hello_verify() {
        let (transport, peer) = MockTransport::pair();
        let server = tokio::spawn(run_server(
            peer,
            ServerOptions {
                hello_verify: false,
                psk: PSK,
            },
        ));
        let dtls = DtlsTransport::connect(Box::new(transport), b"device-1", PSK, &params())
            .await
            .unwrap();
        dtls.send(b"x").await.unwrap();
        assert_eq!(dtls.recv().await.unwrap(), b"x");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_fails_handshake() {
        let (transport, peer) = MockTransport::pair();
        let _server = tokio::spawn(run_server(
            peer,
            ServerOptions {
                hello_verify: true,
                psk: b"another-key",
            },
        ));
        let err = DtlsTransport::connect(Box::new(transport), b"device-1", PSK, &params())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (transport, mut peer) = MockTransport::pair();
        let err = DtlsTransport::connect(Box::new(transport), b"device-1", PSK, &params())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Timeout(_)));
        // Initial flight plus two retransmissions
        let mut count = 0;
        while peer.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
