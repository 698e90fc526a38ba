//! Request/response client over a [`DatagramTransport`]
//!
//! Used for pulling packages from `coap://` and `coaps://` URIs with Block2.
//! Runs its own [`Endpoint`] so it never shares message ids with the
//! registration session.

use std::sync::Arc;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::block::{BlockOption, MAX_SZX};
use crate::endpoint::{Endpoint, EndpointEvent, TransmissionParams};
use crate::error::TransportError;
use crate::message::{option, Code, Message, MessageType};
use crate::transport::DatagramTransport;

pub struct CoapClient {
    transport: Arc<dyn DatagramTransport>,
    endpoint: Endpoint,
}

/// Progress of a block-wise GET
#[derive(Debug, Clone)]
pub struct BlockwiseGet {
    /// Decoded Uri-Path segments
    segments: Vec<String>,
    /// Decoded Uri-Query items
    query: Vec<String>,
    num: u32,
    szx: u8,
    finished: bool,
    received: usize,
    /// Total size announced by the server in Size2
    pub size_hint: Option<u32>,
}

impl BlockwiseGet {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

impl CoapClient {
    pub fn new(transport: Arc<dyn DatagramTransport>, params: TransmissionParams) -> Self {
        Self {
            transport,
            endpoint: Endpoint::new(params),
        }
    }

    /// Send `message` and wait for the matching response
    pub async fn request(&mut self, message: Message) -> Result<Message, TransportError> {
        let (id, bytes) = self.endpoint.send_request(message, Instant::now());
        self.transport.send(&bytes).await?;

        loop {
            let events = match self.endpoint.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        received = self.transport.recv() => {
                            self.endpoint.handle(&received?, Instant::now())
                        }
                        _ = sleep_until(deadline) => self.endpoint.poll(Instant::now()),
                    }
                }
                None => {
                    let received = self.transport.recv().await?;
                    self.endpoint.handle(&received, Instant::now())
                }
            };

            for event in events {
                match event {
                    EndpointEvent::Transmit(bytes) => self.transport.send(&bytes).await?,
                    EndpointEvent::Response { id: got, message } if got == id => {
                        return Ok(message)
                    }
                    EndpointEvent::Failed { id: got, error } if got == id => return Err(error),
                    EndpointEvent::Request(req) => {
                        trace!(code = %req.code, "Refusing request on pull client");
                        let resp = Message::response(&req, Code::SERVICE_UNAVAILABLE);
                        let bytes = self.endpoint.respond(&req, resp, Instant::now());
                        self.transport.send(&bytes).await?;
                    }
                    other => trace!(?other, "Ignoring endpoint event"),
                }
            }
        }
    }

    pub fn blockwise(&self, path: &str, szx: u8) -> BlockwiseGet {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.blockwise_parts(segments, Vec::new(), szx)
    }

    /// Block-wise GET of already decoded path segments and query items
    pub fn blockwise_parts(&self, segments: Vec<String>, query: Vec<String>, szx: u8) -> BlockwiseGet {
        BlockwiseGet {
            segments,
            query,
            num: 0,
            szx: szx.min(MAX_SZX),
            finished: false,
            received: 0,
            size_hint: None,
        }
    }

    /// Fetch the next block, `None` once the body is complete
    ///
    /// A server that answers with a smaller block size than requested
    /// is followed for the rest of the transfer.
    pub async fn next_block(
        &mut self,
        get: &mut BlockwiseGet,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if get.finished {
            return Ok(None);
        }
        let mut req = Message::new(MessageType::Confirmable, Code::GET);
        for segment in &get.segments {
            req.add_option(option::URI_PATH, segment.as_bytes().to_vec());
        }
        for item in &get.query {
            req.add_uri_query(item);
        }
        req.set_block2(BlockOption::new(get.num, false, get.szx));
        let resp = self.request(req).await?;
        if resp.code != Code::CONTENT {
            return Err(TransportError::UnexpectedResponse(format!(
                "{} for /{}",
                resp.code,
                get.segments.join("/")
            )));
        }
        if get.size_hint.is_none() {
            get.size_hint = resp.uint_option(option::SIZE2);
        }

        match resp.block2() {
            None => {
                get.finished = true;
            }
            Some(block) => {
                let block = block?;
                if block.offset() != get.received {
                    return Err(TransportError::UnexpectedResponse(format!(
                        "block {} at offset {} but {} bytes received",
                        block.num,
                        block.offset(),
                        get.received
                    )));
                }
                if block.szx != get.szx {
                    debug!(from = get.szx, to = block.szx, "Server changed block size");
                    get.szx = block.szx;
                }
                get.num = block.num + 1;
                get.finished = !block.more;
            }
        }
        get.received += resp.payload.len();
        Ok(Some(resp.payload))
    }
}
