//! WebSocket extensions (RFC 6455 Section 9)
//!
//! - [`ExtensionOffer`] is the parsed form of one `Sec-WebSocket-Extensions`
//!   entry
//! - [`ExtensionProvider`] is the per-endpoint negotiation policy, shared by all
//!   connections
//! - [`Extension`] is the per-connection stage created by a provider once
//!   negotiation succeeds
//! - [`ExtensionPipeline`] runs the stages: outbound in declaration order,
//!   inbound in reverse

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

use std::fmt;
use std::sync::Arc;

use crate::Role;
use crate::error::{Error, HandshakeError, Result};
use crate::frame::Frame;

// ============================================================================
// Header model
// ============================================================================

/// One `name` or `name=value` parameter of an extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name
    pub name: String,
    /// Value, `None` for flag parameters
    pub value: Option<String>,
}

impl ExtensionParam {
    /// Parameter with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Flag parameter without a value
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) if needs_quoting(value) => write!(f, "{}=\"{}\"", self.name, value),
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .bytes()
            .any(|b| matches!(b, b',' | b';' | b'=' | b'"' | b' ' | b'\t'))
}

/// An extension with its parameters, as offered or accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token, e.g. `permessage-deflate`
    pub name: String,
    /// Parameters in header order
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Offer without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn with_param(mut self, param: ExtensionParam) -> Self {
        self.params.push(param);
        self
    }

    /// Look up a parameter: `None` if absent, `Some(None)` for a flag
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    /// Parse a full header value into its comma-separated entries
    ///
    /// Quoted parameter values are unquoted; entries with an empty name are
    /// skipped.
    pub fn parse_header(value: &str) -> Vec<ExtensionOffer> {
        split_unquoted(value, ',')
            .into_iter()
            .filter_map(|entry| {
                let mut parts = split_unquoted(entry, ';').into_iter();
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                let params = parts
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((k, v)) => ExtensionParam::new(k.trim(), unquote(v.trim())),
                        None => ExtensionParam::flag(p),
                    })
                    .collect();
                Some(ExtensionOffer {
                    name: name.to_string(),
                    params,
                })
            })
            .collect()
    }

    /// Join entries into a header value
    pub fn format_header(offers: &[ExtensionOffer]) -> String {
        offers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, "; {param}")?;
        }
        Ok(())
    }
}

/// Split on `sep`, ignoring separators inside double quotes
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

// ============================================================================
// Extension traits
// ============================================================================

/// A negotiated, per-connection frame transformation
pub trait Extension: Send {
    /// Extension token
    fn name(&self) -> &str;

    /// RSV bits this extension claims, in first-byte positions
    fn rsv_bits(&self) -> u8 {
        0
    }

    /// Transform a data frame before it is encoded
    fn on_outgoing_frame(&mut self, frame: Frame) -> Result<Frame>;

    /// Transform a data frame after it is decoded
    fn on_incoming_frame(&mut self, frame: Frame) -> Result<Frame>;
}

/// Negotiation policy for one extension
///
/// Providers are read-only and shared across connections; each successful
/// negotiation creates a fresh [`Extension`].
pub trait ExtensionProvider: Send + Sync {
    /// Extension token this provider answers to
    fn name(&self) -> &str;

    /// Offer sent by a client
    fn offer(&self) -> ExtensionOffer;

    /// Server side: accept a client offer, producing the response entry and the
    /// connection stage, or decline with `None`
    fn accept(
        &self,
        offer: &ExtensionOffer,
        role: Role,
    ) -> Option<(ExtensionOffer, Box<dyn Extension>)>;

    /// Client side: build the stage from the server's response entry
    fn configure(&self, response: &ExtensionOffer, role: Role) -> Result<Box<dyn Extension>>;
}

/// Shared provider handle
pub type SharedProvider = Arc<dyn ExtensionProvider>;

// ============================================================================
// Pipeline
// ============================================================================

/// Ordered chain of negotiated extensions for one connection
#[derive(Default)]
pub struct ExtensionPipeline {
    stages: Vec<Box<dyn Extension>>,
    rsv: u8,
}

impl fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("stages", &self.names())
            .field("rsv", &self.rsv)
            .finish()
    }
}

impl ExtensionPipeline {
    /// Empty pipeline (identity)
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn push(&mut self, stage: Box<dyn Extension>) {
        self.rsv |= stage.rsv_bits();
        self.stages.push(stage);
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no extension was negotiated
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Union of RSV bits claimed by the stages
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        self.rsv
    }

    /// Run an outbound frame through the stages in declaration order
    pub fn outgoing(&mut self, mut frame: Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame);
        }
        for stage in &mut self.stages {
            let (opcode, fin) = (frame.opcode, frame.fin);
            frame = stage.on_outgoing_frame(frame)?;
            check_preserved(stage.as_ref(), opcode, fin, &frame)?;
        }
        Ok(frame)
    }

    /// Run an inbound frame through the stages in reverse order
    pub fn incoming(&mut self, mut frame: Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame);
        }
        for stage in self.stages.iter_mut().rev() {
            let (opcode, fin) = (frame.opcode, frame.fin);
            frame = stage.on_incoming_frame(frame)?;
            check_preserved(stage.as_ref(), opcode, fin, &frame)?;
        }
        Ok(frame)
    }
}

fn check_preserved(
    stage: &dyn Extension,
    opcode: crate::frame::OpCode,
    fin: bool,
    frame: &Frame,
) -> Result<()> {
    if frame.opcode != opcode || frame.fin != fin {
        return Err(Error::Extension {
            name: stage.name().to_string(),
            message: "extension changed opcode or FIN".into(),
        });
    }
    Ok(())
}

// ============================================================================
// Negotiation
// ============================================================================

/// Server side: match client offers against the providers
///
/// Offers are considered in client order. The first acceptable offer for each
/// extension wins; offers whose RSV bits collide with an already accepted
/// extension are declined.
pub fn negotiate_server(
    offers: &[ExtensionOffer],
    providers: &[SharedProvider],
) -> (Vec<ExtensionOffer>, ExtensionPipeline) {
    let mut accepted: Vec<ExtensionOffer> = Vec::new();
    let mut pipeline = ExtensionPipeline::new();

    for offer in offers {
        if accepted.iter().any(|a| a.name.eq_ignore_ascii_case(&offer.name)) {
            continue;
        }
        let Some(provider) = providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(&offer.name))
        else {
            tracing::trace!(extension = %offer.name, "no provider for offered extension");
            continue;
        };
        match provider.accept(offer, Role::Server) {
            Some((response, stage)) => {
                if stage.rsv_bits() & pipeline.rsv_bits() != 0 {
                    tracing::debug!(extension = %offer.name, "declined: RSV bits already claimed");
                    continue;
                }
                tracing::debug!(extension = %response, "extension accepted");
                accepted.push(response);
                pipeline.push(stage);
            }
            None => tracing::debug!(extension = %offer, "extension offer declined"),
        }
    }

    (accepted, pipeline)
}

/// Client side: build stages from the entries the server accepted
pub fn configure_client(
    accepted: &[ExtensionOffer],
    providers: &[SharedProvider],
) -> Result<ExtensionPipeline> {
    let mut pipeline = ExtensionPipeline::new();
    for response in accepted {
        let provider = providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(&response.name))
            .ok_or_else(|| {
                HandshakeError::Extension(format!("no provider for '{}'", response.name))
            })?;
        let stage = provider.configure(response, Role::Client)?;
        if stage.rsv_bits() & pipeline.rsv_bits() != 0 {
            return Err(HandshakeError::Extension(format!(
                "'{}' reuses RSV bits of another extension",
                response.name
            ))
            .into());
        }
        pipeline.push(stage);
    }
    Ok(pipeline)
}
