//! Confirmable retransmission over the mock transport
//!
//! Time is paused, so each test runs through the RFC 7252 back-off
//! schedule instantly.

use std::sync::Arc;
use std::time::Duration;

use lwm2m_coap::client::CoapClient;
use lwm2m_coap::transport::mock::MockTransport;
use lwm2m_coap::{Code, Message, MessageType, TransmissionParams, TransportError};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

fn params() -> TransmissionParams {
    TransmissionParams {
        ack_timeout: Duration::from_secs(2),
        ack_random_factor: 1.0,
        max_retransmit: 4,
        ..TransmissionParams::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_request_is_retransmitted() {
    let (transport, mut peer) = MockTransport::pair();
    let server = tokio::spawn(async move {
        let started = Instant::now();
        let first = Message::decode(&peer.recv().await.unwrap()).unwrap();
        // Drop the first copy, answer the retransmission
        let again = Message::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.token, first.token);

        let mut resp = Message::response(&again, Code::CONTENT);
        resp.mtype = MessageType::Acknowledgement;
        resp.payload = b"1.0.3".to_vec();
        peer.send(resp.encode());
        // Keep the link open until the client has read the response
        peer
    });

    let mut client = CoapClient::new(Arc::new(transport), params());
    let resp = client.request(Message::request(Code::GET, "fw/version")).await.unwrap();
    assert_eq!(resp.code, Code::CONTENT);
    assert_eq!(resp.payload, b"1.0.3".to_vec());
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let (transport, mut peer) = MockTransport::pair();
    let transport = Arc::new(transport);
    let mut client = CoapClient::new(transport.clone(), params());

    let started = Instant::now();
    let err = client
        .request(Message::request(Code::GET, "fw/pkg"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    // 2 + 4 + 8 + 16 + 32 seconds of back-off
    assert_eq!(started.elapsed(), Duration::from_secs(62));

    // One transmission and four retransmissions, all identical
    let mut copies = Vec::new();
    while let Some(dg) = peer.try_recv() {
        copies.push(dg);
    }
    assert_eq!(copies.len(), 5);
    assert!(copies.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_separate_response_after_empty_ack() {
    let (transport, mut peer) = MockTransport::pair();
    let server = tokio::spawn(async move {
        let req = Message::decode(&peer.recv().await.unwrap()).unwrap();
        peer.send(Message::empty_ack(req.message_id).encode());

        // The ACK stops retransmission; the answer follows later as CON
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(peer.try_recv().is_none());
        let mut resp = Message::new(MessageType::Confirmable, Code::CONTENT);
        resp.message_id = req.message_id.wrapping_add(100);
        resp.token = req.token.clone();
        resp.payload = b"late".to_vec();
        peer.send(resp.encode());

        let ack = Message::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(ack.mtype, MessageType::Acknowledgement);
        assert_eq!(ack.message_id, req.message_id.wrapping_add(100));
    });

    let mut client = CoapClient::new(Arc::new(transport), params());
    let resp = client.request(Message::request(Code::GET, "fw/pkg")).await.unwrap();
    assert_eq!(resp.payload, b"late".to_vec());
    server.await.unwrap();
}
