//! Market Data Streaming Types
//!
//! Stream addressing and inbound frame normalization.
//!
//! # Addressing
//!
//! - Single stream: `{base}/ws/{name}`, frames are bare venue messages
//! - Combined stream: `{base}/stream?streams={a}/{b}`, frames are wrapped in
//!   `{"stream": "<name>", "data": {...}}`
//!
//! After normalization every routed payload is the bare venue message
//! tagged with the stream it belongs to.

use serde::Serialize;
use serde_json::Value;

// =============================================================================
// Errors
// =============================================================================

/// Invalid stream name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamNameError {
    /// Name is empty or only whitespace.
    #[error("stream name cannot be empty")]
    Empty,
    /// Name contains a character that breaks the stream address.
    #[error("stream name {0:?} contains an invalid character")]
    InvalidCharacter(String),
    /// A combined subscription listed no streams.
    #[error("at least one stream name is required")]
    NoStreams,
}

/// Inbound frame that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct MalformedFrame(#[from] serde_json::Error);

// =============================================================================
// Stream Message
// =============================================================================

/// A normalized inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    /// Stream the message belongs to.
    pub stream: String,
    /// Bare venue payload.
    pub data: Value,
}

/// Result of normalizing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedFrame {
    /// Frame routed to a subscribed stream.
    Routed(StreamMessage),
    /// Combined frame without a `stream`/`data` envelope (e.g. a control reply).
    MissingEnvelope,
    /// Combined frame naming a stream this connection does not carry.
    UnknownStream(String),
}

// =============================================================================
// Stream Path
// =============================================================================

/// How frames on a connection are wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Bare venue messages for exactly one stream.
    Raw,
    /// `{stream, data}` envelopes.
    Combined,
}

/// The set of streams carried by one connection and how they are addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamPath {
    names: Vec<String>,
    framing: Framing,
}

impl StreamPath {
    /// Address a single stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains `/`, `?`, `&` or
    /// whitespace.
    pub fn single(name: &str) -> Result<Self, StreamNameError> {
        validate_stream_name(name)?;
        Ok(Self {
            names: vec![name.to_string()],
            framing: Framing::Raw,
        })
    }

    /// Address several streams over one combined connection.
    ///
    /// Duplicate names are collapsed, keeping first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or any name is invalid.
    pub fn combined<S: AsRef<str>>(names: &[S]) -> Result<Self, StreamNameError> {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            validate_stream_name(name)?;
            if !unique.iter().any(|n| n == name) {
                unique.push(name.to_string());
            }
        }

        if unique.is_empty() {
            return Err(StreamNameError::NoStreams);
        }

        Ok(Self {
            names: unique,
            framing: Framing::Combined,
        })
    }

    /// Streams carried by this path.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Frame wrapping used on this path.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Whether `name` is carried by this path.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Address path relative to the venue base URL.
    #[must_use]
    pub fn path(&self) -> String {
        match self.framing {
            Framing::Raw => format!("ws/{}", self.names.join("/")),
            Framing::Combined => format!("stream?streams={}", self.names.join("/")),
        }
    }

    /// Full connection URL.
    #[must_use]
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.path())
    }

    /// Parse and unwrap an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] if the text is not valid JSON.
    pub fn normalize(&self, text: &str) -> Result<NormalizedFrame, MalformedFrame> {
        let value: Value = serde_json::from_str(text)?;

        match self.framing {
            Framing::Raw => Ok(NormalizedFrame::Routed(StreamMessage {
                stream: self.names[0].clone(),
                data: value,
            })),
            Framing::Combined => Ok(self.unwrap_envelope(value)),
        }
    }

    fn unwrap_envelope(&self, value: Value) -> NormalizedFrame {
        let Value::Object(mut envelope) = value else {
            return NormalizedFrame::MissingEnvelope;
        };

        let stream = match envelope.remove("stream") {
            Some(Value::String(stream)) => stream,
            _ => return NormalizedFrame::MissingEnvelope,
        };

        let Some(data) = envelope.remove("data") else {
            return NormalizedFrame::MissingEnvelope;
        };

        if !self.contains(&stream) {
            return NormalizedFrame::UnknownStream(stream);
        }

        NormalizedFrame::Routed(StreamMessage { stream, data })
    }
}

impl std::fmt::Display for StreamPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// Check that a stream name can be embedded in a stream address.
///
/// # Errors
///
/// Returns an error if the name is empty or contains `/`, `?`, `&` or
/// whitespace.
pub fn validate_stream_name(name: &str) -> Result<(), StreamNameError> {
    if name.trim().is_empty() {
        return Err(StreamNameError::Empty);
    }

    if name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '&' | '#'))
    {
        return Err(StreamNameError::InvalidCharacter(name.to_string()));
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
