//! Sample manifests: the digests of every segment of one sample, so a
//! consumer can check membership with a single signature over the manifest.

use bytes::Bytes;

use crate::data::Data;
use crate::wire::{ImmutablePacket, MutablePacket, WireError};

const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Manifest {
    packet: ImmutablePacket,
}

impl Manifest {
    /// One digest blob per data object, in order.
    pub fn new<'a, I>(objects: I) -> Result<Self, WireError>
    where
        I: IntoIterator<Item = &'a Data>,
    {
        let mut packet = MutablePacket::new(&[]);
        for data in objects {
            packet.add_blob(&data.digest())?;
        }
        Ok(Self {
            packet: packet.freeze(),
        })
    }

    pub fn from_wire(bytes: Bytes) -> Result<Self, WireError> {
        let packet = ImmutablePacket::from_wire(bytes);
        if !packet.is_valid() || packet.blobs().any(|b| b.len() != DIGEST_LEN) {
            return Err(WireError::InvalidPacket);
        }
        Ok(Self { packet })
    }

    pub fn has_data(&self, data: &Data) -> bool {
        let digest = data.digest();
        self.packet.blobs().any(|b| b == digest)
    }

    pub fn len(&self) -> usize {
        self.packet.blob_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.packet.clone().into_bytes()
    }
}
