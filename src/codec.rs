//! Gateway payload encoding and decoding.

use std::fmt;

use bytes::Bytes;
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZFlush, MZStatus};
use snafu::prelude::*;

use crate::error::{self, ConfigError, ProtocolError};
use crate::payload::RawPayload;

/// zlib sync-flush suffix terminating every message of a `zlib-stream`
/// transport
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// inflater output chunk size
const INFLATE_CHUNK: usize = 16 * 1024;

/// Wire encoding negotiated during the websocket upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// payloads are JSON objects in text frames
    Json,
    /// payloads are Erlang external terms in binary frames
    Etf,
}

impl Encoding {
    /// Value of the `encoding` query parameter.
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Etf => "etf",
        }
    }
}

/// Compression mode fixed at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// no compression
    #[default]
    None,
    /// individual payloads arrive as complete zlib blobs; this is what the
    /// `compress` field of IDENTIFY negotiates
    Payload,
    /// the whole session shares one zlib stream (`compress=zlib-stream`),
    /// every message ends at a sync-flush boundary
    Stream,
}

/// Encodes and decodes gateway payloads against the encoding and
/// compression fixed at connection time.
///
/// For `zlib-stream` transports the inflater state lives as long as the
/// connection; it is discarded and re-created on reconnect.
pub(crate) struct Codec {
    compression: Compression,
    inflater: Option<Box<InflateState>>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("compression", &self.compression)
            .finish()
    }
}

impl Codec {
    pub fn new(encoding: Encoding, compression: Compression) -> Result<Self, ConfigError> {
        // ETF needs an Erlang external term codec which this build does
        // not carry
        ensure!(
            encoding == Encoding::Json,
            error::UnsupportedEncoding { encoding }
        );

        Ok(Self {
            compression,
            inflater: Self::inflater_for(compression),
        })
    }

    fn inflater_for(compression: Compression) -> Option<Box<InflateState>> {
        (compression == Compression::Stream).then(|| InflateState::new_boxed(DataFormat::Zlib))
    }

    /// Discard all streaming state for a fresh connection.
    pub fn reset(&mut self) {
        self.inflater = Self::inflater_for(self.compression);
    }

    /// Switch per-payload compression on or off, as negotiated by the
    /// `compress` field of IDENTIFY. A `zlib-stream` transport is not
    /// affected.
    pub fn set_payload_compression(&mut self, on: bool) {
        match self.compression {
            Compression::Stream => {
                log::warn!("payload compression ignored on a zlib-stream transport");
            }
            _ => {
                self.compression = if on {
                    Compression::Payload
                } else {
                    Compression::None
                };
            }
        }
    }

    /// Encode an outbound payload as a text frame body.
    pub fn encode(&self, payload: &RawPayload) -> String {
        serde_json::to_string(payload).unwrap()
    }

    /// Decode one complete inbound message into the raw payload shape.
    pub fn decode(&mut self, data: Bytes, binary: bool) -> Result<RawPayload, ProtocolError> {
        if !binary {
            return serde_json::from_slice(&data).context(error::MalformedPayload);
        }

        let decompressed = match self.compression {
            Compression::Stream => {
                // every message must end at a sync-flush boundary; a finished
                // message without the suffix cannot be recovered from
                ensure!(data.ends_with(&ZLIB_SUFFIX), error::MissingZlibSuffix);

                let inflater = self
                    .inflater
                    .get_or_insert_with(|| InflateState::new_boxed(DataFormat::Zlib));
                inflate_into_vec(inflater, &data)?
            }
            // payload compression sends each payload as a self-contained
            // zlib blob
            Compression::Payload => {
                inflate_into_vec(&mut InflateState::new_boxed(DataFormat::Zlib), &data)?
            }
            Compression::None => return error::UnexpectedBinary.fail(),
        };

        serde_json::from_slice(&decompressed).context(error::MalformedPayload)
    }
}

fn inflate_into_vec(state: &mut InflateState, mut input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(input.len().saturating_mul(4));
    let mut buf = vec![0u8; INFLATE_CHUNK];

    loop {
        let result = inflate(state, input, &mut buf, MZFlush::None);
        out.extend_from_slice(&buf[..result.bytes_written]);

        match result.status {
            Ok(MZStatus::StreamEnd) => break,
            Ok(MZStatus::Ok) => {}
            Ok(MZStatus::NeedDict) => {
                return error::DecompressFailed {
                    status: miniz_oxide::MZError::Data,
                }
                .fail()
            }
            Err(status) => return error::DecompressFailed { status }.fail(),
        }

        input = &input[result.bytes_consumed..];
        if result.bytes_written < buf.len() {
            if input.is_empty() {
                break;
            }
            // input remains but none was taken: the stream is stalled
            ensure!(
                result.bytes_consumed > 0,
                error::DecompressFailed {
                    status: miniz_oxide::MZError::Buf,
                }
            );
        }
    }

    Ok(out)
}
