//! Named requests and the data that answers them.

use std::time::Duration;

use bytes::Bytes;

use crate::name::Name;
use crate::wire::ImmutablePacket;

/// Default lifetime stamped on requests built without one.
pub const DEFAULT_LIFETIME: Duration = Duration::from_millis(2000);

/// A request for named data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: Name,
    /// Echoed back by the producer in the segment header. Used to tell an
    /// original answer from a cached one.
    pub nonce: u32,
    pub lifetime: Duration,
    pub can_be_prefix: bool,
    pub must_be_fresh: bool,
}

impl Request {
    pub fn new(name: Name, nonce: u32) -> Self {
        Self {
            name,
            nonce,
            lifetime: DEFAULT_LIFETIME,
            can_be_prefix: false,
            must_be_fresh: false,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Prefix request for the newest matching data (meta discovery).
    pub fn latest(mut self) -> Self {
        self.can_be_prefix = true;
        self.must_be_fresh = true;
        self
    }

    /// Same name, fresh nonce. Used when reissuing.
    pub fn renewed(&self, nonce: u32) -> Self {
        Self {
            nonce,
            ..self.clone()
        }
    }

    /// Does `name` satisfy this request?
    pub fn matches(&self, name: &Name) -> bool {
        if self.can_be_prefix {
            self.name.is_prefix_of(name)
        } else {
            &self.name == name
        }
    }
}

/// A named, immutable piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub name: Name,
    pub content: Bytes,
    /// Segment number of the last data segment of the sample, when the
    /// producer knows it up front.
    pub final_block_id: Option<u64>,
}

impl Data {
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            final_block_id: None,
        }
    }

    pub fn with_final_block(mut self, final_block_id: u64) -> Self {
        self.final_block_id = Some(final_block_id);
        self
    }

    /// BLAKE3 over the name and the publish-time part of the content. This
    /// is what manifests list.
    ///
    /// Content that parses as a wire packet ends in a header blob the
    /// producer rewrites per request; that blob is left out so every answer
    /// for one name shares a digest. Anything else is hashed whole.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        let name = self.name.to_string();
        hasher.update(&(name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());

        let packet = ImmutablePacket::from_wire(self.content.clone());
        if packet.is_valid() && packet.blob_count() > 0 {
            for blob in packet.blobs().take(packet.blob_count() - 1) {
                hasher.update(&(blob.len() as u16).to_le_bytes());
                hasher.update(blob);
            }
            hasher.update(packet.payload());
        } else {
            hasher.update(&self.content);
        }
        *hasher.finalize().as_bytes()
    }
}
