//! Wire encoding and transport compression
//!
//! Which codecs a connection uses is negotiated once, when the shard is
//! configured. Codecs that were not compiled in fall back to plain JSON
//! without compression instead of failing at connect time.

use crate::error::Error;
use crate::protocol::{OutboundFrame, RawPayload};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Payload encoding requested in the gateway URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

impl Encoding {
    /// Value of the `encoding` query parameter
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }

    /// Whether support for this encoding was compiled in
    pub const fn is_available(self) -> bool {
        match self {
            Self::Json => true,
            Self::MessagePack => cfg!(feature = "msgpack"),
        }
    }
}

/// Transport compression requested in the gateway URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    ZlibStream,
}

impl Compression {
    /// Value of the `compress` query parameter, if any
    pub const fn as_query(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ZlibStream => Some("zlib-stream"),
        }
    }

    /// Whether support for this compression was compiled in
    pub const fn is_available(self) -> bool {
        match self {
            Self::None => true,
            Self::ZlibStream => cfg!(feature = "zlib-stream"),
        }
    }
}

/// The codec pair a shard speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecConfig {
    pub encoding: Encoding,
    pub compression: Compression,
}

impl CodecConfig {
    /// Pick the requested codecs, falling back to what this build supports
    pub fn negotiate(encoding: Encoding, compress: bool) -> Self {
        let encoding = if encoding.is_available() {
            encoding
        } else {
            warn!(
                "{} encoding requested but not compiled in, using json",
                encoding.as_str()
            );
            Encoding::Json
        };

        let compression = match compress {
            false => Compression::None,
            true if Compression::ZlibStream.is_available() => Compression::ZlibStream,
            true => {
                warn!("zlib-stream compression requested but not compiled in, disabling");
                Compression::None
            }
        };

        Self {
            encoding,
            compression,
        }
    }
}

/// Zlib context flush suffix terminating every compressed message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[cfg(feature = "zlib-stream")]
const INFLATE_CHUNK: usize = 16 * 1024;

/// Stateful zlib-stream decompressor.
///
/// One instance lives for exactly one connection: the zlib context is
/// shared by every message the gateway sends on it.
#[cfg(feature = "zlib-stream")]
pub struct Inflater {
    decompress: flate2::Decompress,
    buffer: Vec<u8>,
}

#[cfg(feature = "zlib-stream")]
impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "zlib-stream")]
impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("buffered", &self.buffer.len())
            .field("total_in", &self.decompress.total_in())
            .field("total_out", &self.decompress.total_out())
            .finish()
    }
}

#[cfg(feature = "zlib-stream")]
impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Feed one transport frame.
    ///
    /// Returns the decompressed message once the flush suffix has been seen,
    /// `None` while a message is still incomplete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        use flate2::{FlushDecompress, Status};

        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.buffer.len().saturating_mul(4).max(INFLATE_CHUNK));
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
            }
            let in_before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&self.buffer[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Decompress(e.to_string()))?;
            let read = (self.decompress.total_in() - in_before) as usize;
            consumed += read;

            let input_done = consumed >= self.buffer.len();
            let output_has_room = out.len() < out.capacity();
            match status {
                Status::StreamEnd => break,
                _ if input_done && output_has_room => break,
                Status::BufError if read == 0 && output_has_room => {
                    return Err(Error::Decompress("zlib stream stalled".to_string()));
                }
                _ => {}
            }
        }

        self.buffer.clear();
        Ok(Some(out))
    }
}

/// Per-connection codec state
#[derive(Debug)]
pub struct Codec {
    config: CodecConfig,
    #[cfg(feature = "zlib-stream")]
    inflater: Option<Inflater>,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "zlib-stream")]
            inflater: match config.compression {
                Compression::ZlibStream => Some(Inflater::new()),
                Compression::None => None,
            },
        }
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Start over with a fresh decompression context for a new connection
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Decode a transport message into a raw frame.
    ///
    /// Returns `None` for partial compressed messages and control frames.
    pub fn decode(&mut self, message: Message) -> Result<Option<RawPayload>, Error> {
        match message {
            Message::Text(text) => decode_json(text.as_bytes()).map(Some),
            Message::Binary(bytes) => {
                let Some(bytes) = self.inflate(bytes)? else {
                    return Ok(None);
                };
                self.decode_bytes(&bytes).map(Some)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
        }
    }

    #[cfg(feature = "zlib-stream")]
    fn inflate(&mut self, bytes: Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
        match self.inflater.as_mut() {
            Some(inflater) => inflater.push(&bytes),
            None => Ok(Some(bytes)),
        }
    }

    #[cfg(not(feature = "zlib-stream"))]
    fn inflate(&mut self, bytes: Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
        Ok(Some(bytes))
    }

    fn decode_bytes(&self, bytes: &[u8]) -> Result<RawPayload, Error> {
        match self.config.encoding {
            Encoding::Json => decode_json(bytes),
            #[cfg(feature = "msgpack")]
            Encoding::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
            }
            #[cfg(not(feature = "msgpack"))]
            Encoding::MessagePack => Err(Error::Decode("msgpack support not compiled in".to_string())),
        }
    }

    /// Encode an outbound frame for the negotiated encoding
    pub fn encode(&self, frame: &OutboundFrame) -> Result<Message, Error> {
        match self.config.encoding {
            Encoding::Json => serde_json::to_string(frame)
                .map(Message::Text)
                .map_err(|e| Error::Encode(e.to_string())),
            #[cfg(feature = "msgpack")]
            Encoding::MessagePack => rmp_serde::to_vec_named(frame)
                .map(Message::Binary)
                .map_err(|e| Error::Encode(e.to_string())),
            #[cfg(not(feature = "msgpack"))]
            Encoding::MessagePack => Err(Error::Encode("msgpack support not compiled in".to_string())),
        }
    }
}

fn decode_json(bytes: &[u8]) -> Result<RawPayload, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;
    use serde_json::json;

    #[test]
    fn test_negotiate_plain() {
        let config = CodecConfig::negotiate(Encoding::Json, false);
        assert_eq!(config.encoding, Encoding::Json);
        assert_eq!(config.compression, Compression::None);
    }

    #[test]
    fn test_negotiate_respects_build_features() {
        let config = CodecConfig::negotiate(Encoding::MessagePack, true);
        assert_eq!(config.encoding == Encoding::MessagePack, cfg!(feature = "msgpack"));
        assert_eq!(
            config.compression == Compression::ZlibStream,
            cfg!(feature = "zlib-stream")
        );
    }

    #[test]
    fn test_json_text_roundtrip() {
        let mut codec = Codec::new(CodecConfig::default());
        let frame = OutboundFrame::new(OpCode::Heartbeat, 7u64).unwrap();
        let message = codec.encode(&frame).unwrap();
        assert_eq!(message, Message::Text(r#"{"op":1,"d":7}"#.to_string()));

        let raw = codec
            .decode(Message::Text(r#"{"op":11}"#.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(raw.op, 11);
        assert!(raw.d.is_null());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let mut codec = Codec::new(CodecConfig::default());
        let err = codec.decode(Message::Text("not json".to_string())).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn test_msgpack_binary() {
        let mut codec = Codec::new(CodecConfig {
            encoding: Encoding::MessagePack,
            compression: Compression::None,
        });
        let frame = OutboundFrame::new(OpCode::Resume, json!({"seq": 3})).unwrap();
        let Message::Binary(bytes) = codec.encode(&frame).unwrap() else {
            panic!("expected binary frame");
        };

        let inbound = rmp_serde::to_vec_named(&json!({"op": 0, "d": {"x": 1}, "s": 4, "t": "X"})).unwrap();
        let raw = codec.decode(Message::Binary(inbound)).unwrap().unwrap();
        assert_eq!(raw.s, Some(4));
        assert_eq!(raw.t.as_deref(), Some("X"));
        assert!(!bytes.is_empty());
    }

    #[cfg(feature = "zlib-stream")]
    fn sync_flush(encoder: &mut flate2::Compress, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + 64);
        encoder
            .compress_vec(input, &mut out, flate2::FlushCompress::Sync)
            .unwrap();
        out
    }

    #[cfg(feature = "zlib-stream")]
    #[test]
    fn test_inflater_shares_context_across_messages() {
        let mut encoder = flate2::Compress::new(flate2::Compression::default(), true);
        let first = sync_flush(&mut encoder, br#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        let second = sync_flush(&mut encoder, br#"{"op":11}"#);
        assert!(first.ends_with(&ZLIB_SUFFIX));

        let mut codec = Codec::new(CodecConfig {
            encoding: Encoding::Json,
            compression: Compression::ZlibStream,
        });

        // First message split across two transport frames
        let (head, tail) = first.split_at(first.len() / 2);
        assert!(codec.decode(Message::Binary(head.to_vec())).unwrap().is_none());
        let hello = codec.decode(Message::Binary(tail.to_vec())).unwrap().unwrap();
        assert_eq!(hello.op, 10);
        assert_eq!(hello.d["heartbeat_interval"], json!(41250));

        let ack = codec.decode(Message::Binary(second)).unwrap().unwrap();
        assert_eq!(ack.op, 11);
    }

    #[cfg(feature = "zlib-stream")]
    #[test]
    fn test_inflater_rejects_corrupt_stream() {
        let mut inflater = Inflater::new();
        let mut garbage = vec![0x12, 0x34, 0x56, 0x78, 0x9a];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(matches!(inflater.push(&garbage), Err(Error::Decompress(_))));
    }
}
