use http::{
    header,
    uri::{Authority, PathAndQuery, Scheme},
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
};
use tracing::trace;

use super::{MetaData, Request, Response};
use crate::error::{Direction, SessionError, StreamError};

/// Accumulates decoded fields into a [MetaData]. One builder lives per
/// connection and is reset after every block.
///
/// Problems that only concern one message are recorded and reported by
/// [MetaDataBuilder::build], so the caller keeps decoding the block and the
/// compression context stays in sync. Going over the size limit is reported
/// right away: it is the peer misbehaving, not one bad message.
#[derive(Debug)]
pub struct MetaDataBuilder {
    max_size: usize,
    size: usize,

    /// The kind of message we expect when the block itself doesn't say
    inbound: Direction,

    method: Option<Method>,
    scheme: Option<Scheme>,
    authority: Option<Authority>,
    path: Option<PathAndQuery>,
    protocol: Option<String>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    content_length: Option<u64>,

    saw_request_pseudo: bool,
    saw_response_pseudo: bool,
    saw_regular_header: bool,
    empty_path: bool,

    error: Option<StreamError>,
}

impl MetaDataBuilder {
    pub fn new(max_size: usize, inbound: Direction) -> Self {
        Self {
            max_size,
            size: 0,
            inbound,
            method: None,
            scheme: None,
            authority: None,
            path: None,
            protocol: None,
            status: None,
            headers: HeaderMap::new(),
            content_length: None,
            saw_request_pseudo: false,
            saw_response_pseudo: false,
            saw_regular_header: false,
            empty_path: false,
            error: None,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Accumulated size of the current block, counting 32 octets of
    /// overhead per field.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Incorporates one decoded field.
    pub fn emit(&mut self, name: &[u8], value: &[u8]) -> Result<(), SessionError> {
        self.size = self
            .size
            .saturating_add(weir_hpack::entry_size(name, value));
        if self.size > self.max_size {
            return Err(SessionError::HeaderListTooLarge {
                size: self.size,
                max: self.max_size,
            });
        }

        if self.error.is_some() {
            // the message is already rejected, only the size matters now
            return Ok(());
        }

        trace!(
            name = %String::from_utf8_lossy(name),
            value = %String::from_utf8_lossy(value),
            "field"
        );

        let res = if name.first() == Some(&b':') {
            self.emit_pseudo(&name[1..], value)
        } else {
            self.emit_regular(name, value)
        };
        if let Err(reason) = res {
            self.error = Some(StreamError::Malformed {
                direction: self.direction(),
                reason,
            });
        }

        Ok(())
    }

    fn direction(&self) -> Direction {
        if self.saw_response_pseudo {
            Direction::Response
        } else if self.saw_request_pseudo {
            Direction::Request
        } else {
            self.inbound
        }
    }

    fn emit_pseudo(&mut self, name: &[u8], value: &[u8]) -> Result<(), &'static str> {
        if self.saw_regular_header {
            return Err("pseudo-header fields must appear before regular fields");
        }

        if name == b"status" {
            self.saw_response_pseudo = true;
        } else {
            self.saw_request_pseudo = true;
        }
        if self.saw_request_pseudo && self.saw_response_pseudo {
            return Err("request and response pseudo-headers in the same block");
        }

        match name {
            b"method" => {
                let method = Method::from_bytes(value).map_err(|_| "invalid :method")?;
                if self.method.replace(method).is_some() {
                    return Err("duplicate :method pseudo-header");
                }
            }
            b"scheme" => {
                let scheme = Scheme::try_from(value).map_err(|_| "invalid :scheme")?;
                if self.scheme.replace(scheme).is_some() {
                    return Err("duplicate :scheme pseudo-header");
                }
            }
            b"authority" => {
                let authority = Authority::try_from(value).map_err(|_| "invalid :authority")?;
                if self.authority.replace(authority).is_some() {
                    return Err("duplicate :authority pseudo-header");
                }
            }
            b"path" => {
                if self.path.is_some() || self.empty_path {
                    return Err("duplicate :path pseudo-header");
                }
                if value.is_empty() {
                    self.empty_path = true;
                    return Ok(());
                }
                let path = PathAndQuery::try_from(value).map_err(|_| "invalid :path")?;
                self.path = Some(path);
            }
            b"protocol" => {
                let protocol = std::str::from_utf8(value).map_err(|_| "invalid :protocol")?;
                if self.protocol.replace(protocol.to_owned()).is_some() {
                    return Err("duplicate :protocol pseudo-header");
                }
            }
            b"status" => {
                let status = StatusCode::from_bytes(value).map_err(|_| "invalid :status")?;
                if self.status.replace(status).is_some() {
                    return Err("duplicate :status pseudo-header");
                }
            }
            _ => return Err("unknown pseudo-header"),
        }

        Ok(())
    }

    fn emit_regular(&mut self, name: &[u8], value: &[u8]) -> Result<(), &'static str> {
        self.saw_regular_header = true;

        // field names must be lowercase on the wire (RFC 9113, section 8.2.1)
        if name.iter().any(|b| b.is_ascii_uppercase()) {
            return Err("uppercase characters in field name");
        }
        let name = HeaderName::from_bytes(name).map_err(|_| "invalid field name")?;

        let first = value.first();
        let last = value.last();
        if matches!(first, Some(b' ' | b'\t')) || matches!(last, Some(b' ' | b'\t')) {
            return Err("field value starts or ends with whitespace");
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| "invalid field value")?;

        if name == header::CONNECTION {
            if value.as_bytes() != b"TE" {
                return Err("connection-specific field");
            }
        } else if name == header::TRANSFER_ENCODING
            || name == header::UPGRADE
            || name.as_str() == "keep-alive"
            || name.as_str() == "proxy-connection"
        {
            return Err("connection-specific field");
        } else if name == header::TE {
            if !value.as_bytes().eq_ignore_ascii_case(b"trailers") {
                return Err("te field with a value other than trailers");
            }
        } else if name == header::CONTENT_LENGTH {
            let len = std::str::from_utf8(value.as_bytes())
                .ok()
                .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or("invalid content-length")?;
            match self.content_length {
                Some(prev) if prev != len => return Err("conflicting content-length values"),
                _ => self.content_length = Some(len),
            }
        }

        self.headers.append(name, value);
        Ok(())
    }

    /// Finalizes the block into a [MetaData], then resets the builder.
    pub fn build(&mut self) -> Result<MetaData, StreamError> {
        let res = self.finish();
        self.reset();
        res
    }

    fn finish(&mut self) -> Result<MetaData, StreamError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let headers = std::mem::take(&mut self.headers);
        let content_length = self.content_length;

        if self.saw_response_pseudo {
            let status = self.status.take().ok_or(self.malformed("No Status"))?;
            return Ok(MetaData::Response(Response {
                status,
                headers,
                content_length,
            }));
        }

        if !self.saw_request_pseudo {
            return Ok(MetaData::Fields(headers));
        }

        let method = self.method.take().ok_or(self.malformed("No Method"))?;
        let protocol = self.protocol.take();

        if method == Method::CONNECT && protocol.is_none() {
            // a tunnel: no scheme, no path, just where to go
            if self.scheme.is_some() || self.path.is_some() || self.empty_path {
                return Err(self.malformed("CONNECT must not carry :scheme or :path"));
            }
            let authority = self.authority.take().ok_or(self.malformed("No Authority"))?;
            return Ok(MetaData::ConnectRequest(Request {
                method,
                scheme: None,
                authority: Some(authority),
                path: None,
                protocol: None,
                headers,
                content_length,
            }));
        }

        if protocol.is_some() && method != Method::CONNECT {
            return Err(self.malformed(":protocol is only allowed on CONNECT"));
        }

        let scheme = self.scheme.take().ok_or(self.malformed("No Scheme"))?;
        if self.empty_path {
            return Err(self.malformed("empty :path"));
        }
        let path = self.path.take().ok_or(self.malformed("No Path"))?;

        let request = Request {
            method,
            scheme: Some(scheme),
            authority: self.authority.take(),
            path: Some(path),
            protocol,
            headers,
            content_length,
        };
        if request.method == Method::CONNECT {
            Ok(MetaData::ConnectRequest(request))
        } else {
            Ok(MetaData::Request(request))
        }
    }

    fn malformed(&self, reason: &'static str) -> StreamError {
        StreamError::Malformed {
            direction: self.direction(),
            reason,
        }
    }

    /// Clears everything accumulated so far. The size limit and inbound
    /// direction are kept.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_size, self.inbound);
    }
}
