//! Minimal SDP model.
//!
//! The media engine owns offer/answer generation; signaling treats SDP as
//! opaque text. This model parses just enough structure to answer the
//! questions call control asks: which media lines are present, what payload
//! types they carry, and which direction attribute is in force. Everything
//! else is preserved verbatim so a parsed session reserializes losslessly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Media stream direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaDirection {
    /// `a=sendrecv`
    SendRecv,
    /// `a=sendonly` (local hold)
    SendOnly,
    /// `a=recvonly`
    RecvOnly,
    /// `a=inactive`
    Inactive,
}

impl MediaDirection {
    /// Attribute name as it appears after `a=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn from_attribute(attr: &str) -> Option<MediaDirection> {
        match attr {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// Whether a stream with this direction has local audio paused.
    pub fn is_paused(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `m=` section with its following lines kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// Media type (`audio`, `video`, ...)
    pub kind: String,
    /// Transport port from the m-line
    pub port: u16,
    /// Transport protocol (`RTP/AVP`, `UDP/TLS/RTP/SAVPF`, ...)
    pub protocol: String,
    /// Format (payload type) tokens in m-line order
    pub formats: Vec<String>,
    /// Raw lines following the m-line, up to the next m-line
    pub lines: Vec<String>,
}

impl MediaDescription {
    /// Values of every `a=` line in this section.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| l.strip_prefix("a="))
    }

    /// The direction attribute on this section, if any.
    pub fn direction(&self) -> Option<MediaDirection> {
        self.attributes().find_map(MediaDirection::from_attribute)
    }

    /// Numeric payload types from the m-line format list.
    pub fn payload_types(&self) -> Vec<u8> {
        self.formats.iter().filter_map(|f| f.parse().ok()).collect()
    }
}

/// A parsed SDP session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpSession {
    /// Raw session-level lines (before the first m-line), in order
    pub session_lines: Vec<String>,
    /// Media sections in order
    pub media: Vec<MediaDescription>,
}

impl SdpSession {
    /// Parse an SDP body. Tolerates LF-only line endings on input;
    /// serialization always emits CRLF.
    pub fn parse(input: &str) -> Result<SdpSession> {
        let mut session_lines = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();
        let mut saw_version = false;

        for raw in input.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            let mut chars = line.chars();
            let kind = chars.next();
            if chars.next() != Some('=') {
                return Err(Error::InvalidSdp(format!("not a type=value line: {line:?}")));
            }
            if kind == Some('v') {
                saw_version = true;
            }
            if kind == Some('m') {
                media.push(parse_media_line(&line[2..])?);
            } else if let Some(current) = media.last_mut() {
                current.lines.push(line.to_string());
            } else {
                session_lines.push(line.to_string());
            }
        }

        if !saw_version {
            return Err(Error::InvalidSdp("missing v= line".into()));
        }
        Ok(SdpSession {
            session_lines,
            media,
        })
    }

    /// Session-level direction attribute, if any.
    pub fn session_direction(&self) -> Option<MediaDirection> {
        self.session_lines
            .iter()
            .filter_map(|l| l.strip_prefix("a="))
            .find_map(MediaDirection::from_attribute)
    }

    /// Effective direction of the first audio section: the media-level
    /// attribute, else the session-level one, else `sendrecv`.
    pub fn audio_direction(&self) -> MediaDirection {
        self.media
            .iter()
            .find(|m| m.kind == "audio")
            .and_then(|m| m.direction())
            .or_else(|| self.session_direction())
            .unwrap_or(MediaDirection::SendRecv)
    }
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let mut parts = value.split_ascii_whitespace();
    let kind = parts
        .next()
        .ok_or_else(|| Error::InvalidSdp("empty m= line".into()))?;
    let port_field = parts
        .next()
        .ok_or_else(|| Error::InvalidSdp(format!("m= line missing port: {value:?}")))?;
    // "49170/2" carries a stream count; only the port matters here
    let port = port_field
        .split('/')
        .next()
        .unwrap_or(port_field)
        .parse::<u16>()
        .map_err(|_| Error::InvalidSdp(format!("bad port in m= line: {value:?}")))?;
    let protocol = parts
        .next()
        .ok_or_else(|| Error::InvalidSdp(format!("m= line missing protocol: {value:?}")))?;
    let formats = parts.map(str::to_string).collect();
    Ok(MediaDescription {
        kind: kind.to_string(),
        port,
        protocol: protocol.to_string(),
        formats,
        lines: Vec::new(),
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session_lines {
            write!(f, "{line}\r\n")?;
        }
        for m in &self.media {
            write!(f, "m={} {} {} {}\r\n", m.kind, m.port, m.protocol, m.formats.join(" "))?;
            for line in &m.lines {
                write!(f, "{line}\r\n")?;
            }
        }
        Ok(())
    }
}
