//! Per-Message Deflate Extension (RFC 7692)
//!
//! Compresses whole data messages with raw DEFLATE and flags them with RSV1.
//!
//! - outbound: only unfragmented text/binary frames are compressed; a message
//!   sent in fragments goes out uncompressed
//! - inbound: an RSV1 message is inflated frame by frame, so a fragmented
//!   compressed message never has to be buffered in compressed form
//! - the inflated size of a message is bounded by a ceiling

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{Extension, ExtensionOffer, ExtensionParam, ExtensionProvider};
use crate::error::{Error, FrameError, HandshakeError, Result};
use crate::frame::{Frame, OpCode, RSV1};
use crate::{DEFAULT_MAX_MESSAGE_SIZE, Role};

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer removed after compression and restored before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Smallest window accepted; zlib has no raw-deflate mode for 2^8
pub const MIN_WINDOW_BITS: u8 = 9;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for permessage-deflate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Largest window the server compresses with
    pub server_max_window_bits: u8,
    /// Largest window the client compresses with
    pub client_max_window_bits: u8,
    /// Server resets its compressor after each message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9)
    pub compression_level: u32,
    /// Messages smaller than this are sent uncompressed
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
        }
    }
}

impl DeflateConfig {
    /// Small windows, no context takeover, fast compression
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_level: 1,
            compression_threshold: 64,
        }
    }

    /// Full windows and maximum compression
    pub fn best_compression() -> Self {
        Self {
            compression_level: 9,
            compression_threshold: 16,
            ..Self::default()
        }
    }
}

/// Parameters of one offer or response, validated
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DeflateParams {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    /// `Some(None)`: client advertised support without a value
    client_max_window_bits: Option<Option<u8>>,
}

impl DeflateParams {
    fn parse(offer: &ExtensionOffer) -> std::result::Result<Self, HandshakeError> {
        let mut params = Self::default();
        let mut seen: Vec<&str> = Vec::with_capacity(offer.params.len());

        for param in &offer.params {
            let name = param.name.as_str();
            if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                return Err(invalid(format!("duplicate parameter {name}")));
            }
            seen.push(name);

            match name.to_ascii_lowercase().as_str() {
                SERVER_NO_CONTEXT_TAKEOVER => {
                    no_value(param)?;
                    params.server_no_context_takeover = true;
                }
                CLIENT_NO_CONTEXT_TAKEOVER => {
                    no_value(param)?;
                    params.client_no_context_takeover = true;
                }
                SERVER_MAX_WINDOW_BITS => {
                    let value = param
                        .value
                        .as_deref()
                        .ok_or_else(|| invalid(format!("{SERVER_MAX_WINDOW_BITS} needs a value")))?;
                    params.server_max_window_bits = Some(window_bits(value)?);
                }
                CLIENT_MAX_WINDOW_BITS => {
                    params.client_max_window_bits = Some(match param.value.as_deref() {
                        Some(value) => Some(window_bits(value)?),
                        None => None,
                    });
                }
                other => return Err(invalid(format!("unknown parameter {other}"))),
            }
        }

        Ok(params)
    }
}

fn invalid(message: String) -> HandshakeError {
    HandshakeError::Extension(format!("{EXTENSION_NAME}: {message}"))
}

fn no_value(param: &ExtensionParam) -> std::result::Result<(), HandshakeError> {
    match param.value {
        Some(_) => Err(invalid(format!("{} must not have a value", param.name))),
        None => Ok(()),
    }
}

fn window_bits(value: &str) -> std::result::Result<u8, HandshakeError> {
    let bits: u8 = value
        .parse()
        .map_err(|_| invalid(format!("invalid window bits '{value}'")))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(invalid(format!(
            "window bits {bits} out of range ({MIN_WINDOW_BITS}-{MAX_WINDOW_BITS})"
        )));
    }
    Ok(bits)
}

// ============================================================================
// Compressor / decompressor
// ============================================================================

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
    threshold: usize,
}

impl DeflateEncoder {
    /// Create a new encoder
    pub fn new(window_bits: u8, no_context_takeover: bool, level: u32, threshold: usize) -> Self {
        Self {
            compress: Compress::new_with_window_bits(Compression::new(level), false, window_bits),
            no_context_takeover,
            threshold,
        }
    }

    /// Compress one whole message
    ///
    /// Returns `None` when the message is under the threshold or would not
    /// shrink.
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        let mut output = Vec::with_capacity(data.len() / 2 + 64);
        let mut input = data;

        loop {
            if output.capacity() - output.len() < 64 {
                output.reserve(4096);
            }
            let spare = output.capacity() - output.len();
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            self.compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            input = &input[consumed..];

            // Done once all input is in and the sync flush fit in the buffer
            if input.is_empty() && produced < spare {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        if self.no_context_takeover {
            self.compress.reset();
        }

        if output.len() >= data.len() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(output)))
    }

    /// Reset the compression context
    pub fn reset(&mut self) {
        self.compress.reset();
    }
}

/// Deflate decompressor for incoming messages
///
/// Always inflates with the largest window, which accepts streams produced
/// with any smaller one.
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a new decoder
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Inflate one frame's worth of a compressed message
    ///
    /// `produced_so_far` is the inflated size of the earlier frames of the
    /// same message; the result may not push the total past `max_size`.
    pub fn decompress_chunk(
        &mut self,
        data: &[u8],
        last: bool,
        produced_so_far: usize,
        max_size: usize,
    ) -> Result<Bytes> {
        let mut output = Vec::with_capacity((data.len() * 2).clamp(256, 64 * 1024));
        self.inflate(data, &mut output, produced_so_far, max_size)?;
        if last {
            self.inflate(&DEFLATE_TRAILER, &mut output, produced_so_far, max_size)?;
            if self.no_context_takeover {
                self.decompress.reset(false);
            }
        }
        Ok(Bytes::from(output))
    }

    /// Inflate a complete message
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        self.decompress_chunk(data, true, 0, max_size)
    }

    fn inflate(
        &mut self,
        mut input: &[u8],
        output: &mut Vec<u8>,
        produced_so_far: usize,
        max_size: usize,
    ) -> Result<()> {
        loop {
            if output.capacity() - output.len() < 256 {
                output.reserve(output.capacity().max(4096));
            }
            let spare = output.capacity() - output.len();
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress_vec(input, output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {e}")))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced_so_far + output.len() > max_size {
                return Err(Error::MessageTooLarge);
            }

            match status {
                Status::StreamEnd => return Ok(()),
                _ if input.is_empty() && produced < spare => return Ok(()),
                _ if consumed == 0 && produced == 0 => {
                    return Err(Error::Compression("inflate made no progress".into()));
                }
                _ => {}
            }
        }
    }

    /// Reset the decompression context
    pub fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

// ============================================================================
// Extension stage
// ============================================================================

/// Negotiated permessage-deflate state for one connection
pub struct PerMessageDeflate {
    encoder: DeflateEncoder,
    decoder: DeflateDecoder,
    max_message_size: usize,
    /// Inflated bytes of the compressed message in progress, if any
    inflating: Option<usize>,
}

impl PerMessageDeflate {
    /// Build the stage for `role` from agreed parameters
    fn new(
        config: &DeflateConfig,
        agreed: &DeflateParams,
        role: Role,
        max_message_size: usize,
    ) -> Self {
        let server_bits = agreed.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS);
        let client_bits = agreed.client_max_window_bits.flatten().unwrap_or(MAX_WINDOW_BITS);

        let (own_bits, own_reset, peer_reset) = match role {
            Role::Server => (
                server_bits,
                agreed.server_no_context_takeover,
                agreed.client_no_context_takeover,
            ),
            Role::Client => (
                client_bits,
                agreed.client_no_context_takeover,
                agreed.server_no_context_takeover,
            ),
        };

        Self {
            encoder: DeflateEncoder::new(
                own_bits,
                own_reset,
                config.compression_level,
                config.compression_threshold,
            ),
            decoder: DeflateDecoder::new(peer_reset),
            max_message_size,
            inflating: None,
        }
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn rsv_bits(&self) -> u8 {
        RSV1
    }

    fn on_outgoing_frame(&mut self, mut frame: Frame) -> Result<Frame> {
        let whole_message = frame.fin && matches!(frame.opcode, OpCode::Text | OpCode::Binary);
        if !whole_message {
            return Ok(frame);
        }
        if let Some(compressed) = self.encoder.compress(&frame.payload)? {
            frame.payload = compressed;
            frame.rsv1 = true;
        }
        Ok(frame)
    }

    fn on_incoming_frame(&mut self, mut frame: Frame) -> Result<Frame> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                self.inflating = frame.rsv1.then_some(0);
            }
            // RSV1 belongs to the first frame of a message only
            OpCode::Continuation if frame.rsv1 => {
                return Err(FrameError::ReservedBitsSet.into());
            }
            _ => {}
        }

        let Some(so_far) = self.inflating else {
            return Ok(frame);
        };

        let inflated =
            self.decoder
                .decompress_chunk(&frame.payload, frame.fin, so_far, self.max_message_size)?;
        self.inflating = if frame.fin {
            None
        } else {
            Some(so_far + inflated.len())
        };
        frame.payload = inflated;
        frame.rsv1 = false;
        Ok(frame)
    }
}

// ============================================================================
// Provider
// ============================================================================

/// permessage-deflate negotiation policy
#[derive(Debug, Clone)]
pub struct DeflateProvider {
    config: DeflateConfig,
    max_message_size: usize,
}

impl Default for DeflateProvider {
    fn default() -> Self {
        Self::new(DeflateConfig::default())
    }
}

impl DeflateProvider {
    /// Provider with the given configuration
    pub fn new(config: DeflateConfig) -> Self {
        Self {
            config,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Ceiling on the inflated size of one message
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &DeflateConfig {
        &self.config
    }
}

impl ExtensionProvider for DeflateProvider {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn offer(&self) -> ExtensionOffer {
        let mut offer = ExtensionOffer::new(EXTENSION_NAME);
        if self.config.server_no_context_takeover {
            offer.params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if self.config.client_no_context_takeover {
            offer.params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if self.config.server_max_window_bits < MAX_WINDOW_BITS {
            offer.params.push(ExtensionParam::new(
                SERVER_MAX_WINDOW_BITS,
                self.config.server_max_window_bits.to_string(),
            ));
        }
        offer.params.push(if self.config.client_max_window_bits < MAX_WINDOW_BITS {
            ExtensionParam::new(
                CLIENT_MAX_WINDOW_BITS,
                self.config.client_max_window_bits.to_string(),
            )
        } else {
            ExtensionParam::flag(CLIENT_MAX_WINDOW_BITS)
        });
        offer
    }

    fn accept(
        &self,
        offer: &ExtensionOffer,
        role: Role,
    ) -> Option<(ExtensionOffer, Box<dyn Extension>)> {
        let requested = match DeflateParams::parse(offer) {
            Ok(params) => params,
            Err(err) => {
                tracing::debug!(error = %err, "declining permessage-deflate offer");
                return None;
            }
        };

        let server_bits = match requested.server_max_window_bits {
            Some(bits) => bits.min(self.config.server_max_window_bits),
            None => self.config.server_max_window_bits,
        };
        // A client limit may only be sent back if the client advertised it
        let client_bits = match requested.client_max_window_bits {
            Some(Some(bits)) => Some(bits.min(self.config.client_max_window_bits)),
            Some(None) if self.config.client_max_window_bits < MAX_WINDOW_BITS => {
                Some(self.config.client_max_window_bits)
            }
            _ => None,
        };

        let agreed = DeflateParams {
            server_no_context_takeover: requested.server_no_context_takeover
                || self.config.server_no_context_takeover,
            client_no_context_takeover: requested.client_no_context_takeover
                || self.config.client_no_context_takeover,
            server_max_window_bits: (server_bits < MAX_WINDOW_BITS).then_some(server_bits),
            client_max_window_bits: client_bits.map(Some),
        };

        let mut response = ExtensionOffer::new(EXTENSION_NAME);
        if agreed.server_no_context_takeover {
            response.params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if agreed.client_no_context_takeover {
            response.params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if let Some(bits) = agreed.server_max_window_bits {
            response
                .params
                .push(ExtensionParam::new(SERVER_MAX_WINDOW_BITS, bits.to_string()));
        }
        if let Some(bits) = client_bits {
            response
                .params
                .push(ExtensionParam::new(CLIENT_MAX_WINDOW_BITS, bits.to_string()));
        }

        let stage = PerMessageDeflate::new(&self.config, &agreed, role, self.max_message_size);
        Some((response, Box::new(stage)))
    }

    fn configure(&self, response: &ExtensionOffer, role: Role) -> Result<Box<dyn Extension>> {
        let mut agreed = DeflateParams::parse(response)?;
        if matches!(agreed.client_max_window_bits, Some(None)) {
            let message = format!("{CLIENT_MAX_WINDOW_BITS} in a response needs a value");
            return Err(invalid(message).into());
        }
        if self.config.server_max_window_bits < MAX_WINDOW_BITS
            && agreed.server_max_window_bits.is_none_or(|b| b > self.config.server_max_window_bits)
        {
            return Err(invalid(format!("server ignored {SERVER_MAX_WINDOW_BITS}")).into());
        }
        agreed.client_no_context_takeover |= self.config.client_no_context_takeover;
        if agreed.client_max_window_bits.is_none()
            && self.config.client_max_window_bits < MAX_WINDOW_BITS
        {
            agreed.client_max_window_bits = Some(Some(self.config.client_max_window_bits));
        }
        Ok(Box::new(PerMessageDeflate::new(
            &self.config,
            &agreed,
            role,
            self.max_message_size,
        )))
    }
}
