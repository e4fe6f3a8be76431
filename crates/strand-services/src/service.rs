//! Collaborator traits.
//!
//! The consumer core never touches a socket, a decoder or a key store. It
//! talks to the outside through these three seams, and the embedding
//! application plugs in the real thing.

use futures::future::BoxFuture;
use strand_core::{Data, Request};

use crate::playout::PlayoutSample;

/// Outcome of a request that produced no data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("request refused: {0}")]
    Nack(String),
    #[error("face is closed")]
    Closed,
}

/// Name-based request/response transport.
///
/// `express` sends one named request and resolves with the matching data,
/// or an error once the request's lifetime runs out. It must not block.
pub trait Face: Send + Sync {
    fn express(&self, request: Request) -> BoxFuture<'static, Result<Data, FetchError>>;
}

/// Signature check. Data failing verification is still used, but counted.
pub trait Validator: Send + Sync {
    fn verify(&self, data: &Data) -> bool;
}

/// Trusts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn verify(&self, _data: &Data) -> bool {
        true
    }
}

/// Receives samples in playback order, at playback pace.
pub trait SampleSink: Send + Sync {
    fn render(&self, sample: PlayoutSample);
}
