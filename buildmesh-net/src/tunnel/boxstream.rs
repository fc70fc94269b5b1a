//! Encrypted frame codec.
//!
//! Frames are encoded as:
//! - 4 bytes: big-endian ciphertext length
//! - N bytes: AES-256-GCM ciphertext (plaintext + 16-byte tag)
//!
//! The length header is bound into the tag as associated data. An
//! authenticated empty plaintext is the goodbye frame. Each direction keeps
//! its own key and nonce counter; the counter only advances on success.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use buildmesh_core::crypto::sealing::{self, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{MeshError, MeshResult};

/// Header size: 4 bytes length.
const HEADER_SIZE: usize = 4;

/// Largest ciphertext accepted on the wire.
const MAX_CIPHERTEXT: usize = MAX_FRAME_SIZE + TAG_SIZE;

/// One decrypted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload.
    Data(Bytes),
    /// The remote side is closing the stream.
    Goodbye,
}

/// Key and nonce counter for one direction of a tunnel.
#[derive(Clone)]
pub struct DirectionKey {
    pub(crate) key: [u8; KEY_SIZE],
    pub(crate) nonce: [u8; NONCE_SIZE],
}

impl DirectionKey {
    /// Create a direction key with its starting nonce.
    pub fn new(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, nonce }
    }
}

impl std::fmt::Debug for DirectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DirectionKey(..)")
    }
}

/// Session keys established by the handshake.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Encrypts frames we send.
    pub send: DirectionKey,
    /// Decrypts frames we receive.
    pub recv: DirectionKey,
}

/// Codec for the encrypted box stream.
#[derive(Debug)]
pub struct BoxCodec {
    keys: SessionKeys,
    /// Ciphertext length of the current frame (if the header has been read).
    current_length: Option<usize>,
}

impl BoxCodec {
    /// Create a codec from handshake output.
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            current_length: None,
        }
    }

    fn seal_frame(&mut self, plaintext: &[u8], dst: &mut BytesMut) -> MeshResult<()> {
        if plaintext.len() > MAX_FRAME_SIZE {
            return Err(MeshError::FrameTooLarge {
                size: plaintext.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let header = ((plaintext.len() + TAG_SIZE) as u32).to_be_bytes();
        let ciphertext = sealing::seal(&self.keys.send.key, &self.keys.send.nonce, &header, plaintext)?;
        sealing::increment_nonce(&mut self.keys.send.nonce);

        dst.reserve(HEADER_SIZE + ciphertext.len());
        dst.put_slice(&header);
        dst.put_slice(&ciphertext);
        Ok(())
    }
}

impl Decoder for BoxCodec {
    type Item = Frame;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> MeshResult<Option<Frame>> {
        if self.current_length.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length > MAX_CIPHERTEXT {
                return Err(MeshError::FrameTooLarge {
                    size: length.saturating_sub(TAG_SIZE),
                    max: MAX_FRAME_SIZE,
                });
            }
            if length < TAG_SIZE {
                return Err(MeshError::MalformedMessage(format!(
                    "frame of {} bytes is shorter than its tag",
                    length
                )));
            }

            self.current_length = Some(length);
        }

        let length = match self.current_length {
            Some(length) => length,
            None => return Ok(None),
        };

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_SIZE);
        let ciphertext = src.split_to(length);
        self.current_length = None;

        let plaintext = sealing::open(&self.keys.recv.key, &self.keys.recv.nonce, &header, &ciphertext)?;
        sealing::increment_nonce(&mut self.keys.recv.nonce);

        if plaintext.is_empty() {
            Ok(Some(Frame::Goodbye))
        } else {
            Ok(Some(Frame::Data(Bytes::from(plaintext))))
        }
    }
}

impl Encoder<Frame> for BoxCodec {
    type Error = MeshError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> MeshResult<()> {
        match frame {
            Frame::Data(payload) if payload.is_empty() => Err(MeshError::MalformedMessage(
                "empty data frame".to_string(),
            )),
            Frame::Data(payload) => self.seal_frame(payload.chunk(), dst),
            Frame::Goodbye => self.seal_frame(&[], dst),
        }
    }
}
