//! Decoded header blocks. A [MetaData] is what one HEADERS (or PUSH_PROMISE)
//! block turns into once its pseudo-headers have been validated.

use std::borrow::Cow;

use http::{
    header,
    uri::{Authority, PathAndQuery, Scheme},
    HeaderMap, Method, StatusCode, Uri,
};

mod builder;
pub use builder::MetaDataBuilder;

/// A request line, as pseudo-headers, plus fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Absent for plain CONNECT requests
    pub scheme: Option<Scheme>,
    pub authority: Option<Authority>,
    /// Absent for plain CONNECT requests
    pub path: Option<PathAndQuery>,
    /// The `:protocol` pseudo-header of extended CONNECT (RFC 8441)
    pub protocol: Option<String>,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

impl Request {
    /// Builds a request from a method and an absolute URI. A URI without a
    /// path gets `/`.
    pub fn new(method: Method, uri: Uri) -> Self {
        let parts = uri.into_parts();
        let path = parts
            .path_and_query
            .or_else(|| Some(PathAndQuery::from_static("/")));
        Self {
            method,
            scheme: parts.scheme,
            authority: parts.authority,
            path,
            protocol: None,
            headers: Default::default(),
            content_length: None,
        }
    }

    /// A `CONNECT` request for a tunnel to `authority`.
    pub fn connect(authority: Authority) -> Self {
        Self {
            method: Method::CONNECT,
            scheme: None,
            authority: Some(authority),
            path: None,
            protocol: None,
            headers: Default::default(),
            content_length: None,
        }
    }

    pub fn with_header(mut self, name: header::HeaderName, value: header::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }
}

/// A status line, as a pseudo-header, plus fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Default::default(),
            content_length: None,
        }
    }

    pub fn with_header(mut self, name: header::HeaderName, value: header::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaData {
    Request(Request),
    /// A CONNECT request, with or without `:protocol`
    ConnectRequest(Request),
    Response(Response),
    /// A block without pseudo-headers: trailers
    Fields(HeaderMap),
}

impl MetaData {
    pub fn headers(&self) -> &HeaderMap {
        match self {
            MetaData::Request(req) | MetaData::ConnectRequest(req) => &req.headers,
            MetaData::Response(res) => &res.headers,
            MetaData::Fields(fields) => fields,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            MetaData::Request(req) | MetaData::ConnectRequest(req) => req.content_length,
            MetaData::Response(res) => res.content_length,
            MetaData::Fields(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MetaData::Request(_) | MetaData::ConnectRequest(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, MetaData::Response(_))
    }

    /// A 1xx response, which a final response must follow.
    pub fn is_informational(&self) -> bool {
        matches!(self, MetaData::Response(res) if res.status.is_informational())
    }

    /// The field lines to put on the wire, pseudo-headers first.
    /// Connection-specific fields have no meaning in HTTP/2 and HTTP/3 and
    /// are left out.
    pub(crate) fn to_fields(&self) -> Vec<(&[u8], Cow<'_, [u8]>)> {
        let mut fields: Vec<(&[u8], Cow<'_, [u8]>)> = Vec::with_capacity(self.headers().len() + 5);

        match self {
            MetaData::Request(req) | MetaData::ConnectRequest(req) => {
                fields.push((b":method", Cow::Borrowed(req.method.as_str().as_bytes())));
                if let Some(scheme) = &req.scheme {
                    fields.push((b":scheme", Cow::Borrowed(scheme.as_str().as_bytes())));
                }
                if let Some(authority) = &req.authority {
                    fields.push((b":authority", Cow::Borrowed(authority.as_str().as_bytes())));
                }
                if let Some(path) = &req.path {
                    fields.push((b":path", Cow::Borrowed(path.as_str().as_bytes())));
                }
                if let Some(protocol) = &req.protocol {
                    fields.push((b":protocol", Cow::Borrowed(protocol.as_bytes())));
                }
            }
            MetaData::Response(res) => {
                fields.push((b":status", Cow::Borrowed(res.status.as_str().as_bytes())));
            }
            MetaData::Fields(_) => {}
        }

        let headers = self.headers();
        for (name, value) in headers.iter() {
            if is_connection_specific(name) {
                continue;
            }
            fields.push((name.as_str().as_bytes(), Cow::Borrowed(value.as_bytes())));
        }

        if let Some(len) = self.content_length() {
            if !headers.contains_key(header::CONTENT_LENGTH) {
                fields.push((b"content-length", Cow::Owned(len.to_string().into_bytes())));
            }
        }

        fields
    }
}

fn is_connection_specific(name: &header::HeaderName) -> bool {
    // `te: trailers` is the one exception, and it survives
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}
