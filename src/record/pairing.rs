//! Request/response pairing.

use std::collections::VecDeque;
use std::net::SocketAddr;

use thiserror::Error;

use crate::http::{HttpRequest, HttpResponse};
use crate::record::schema::RequestResponse;

/// Pairing violations. Fatal to the connection that produced them.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("response \"{first_line}\" arrived with no pending request")]
    OrphanResponse { first_line: String },
}

/// Requests forwarded upstream and still waiting for their response.
///
/// The head of the queue is the pending pair: the next final response
/// always completes it.
#[derive(Debug)]
pub struct PendingPairs {
    destination: SocketAddr,
    requests: VecDeque<HttpRequest>,
}

impl PendingPairs {
    pub fn new(destination: SocketAddr) -> Self {
        Self {
            destination,
            requests: VecDeque::new(),
        }
    }

    /// Record a request that has just been written to the server.
    pub fn request_forwarded(&mut self, request: HttpRequest) {
        self.requests.push_back(request);
    }

    /// Pair `response` with the oldest unanswered request.
    pub fn complete(&mut self, response: &HttpResponse) -> Result<RequestResponse, PairingError> {
        let request = self
            .requests
            .pop_front()
            .ok_or_else(|| PairingError::OrphanResponse {
                first_line: response.message().first_line().to_string(),
            })?;

        Ok(RequestResponse {
            ip: self.destination.ip().to_string(),
            port: u32::from(self.destination.port()),
            scheme: "http".to_string(),
            request: Some(request.to_record()),
            response: Some(response.to_record()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}
