// Hearth
//
// Copyright 2023 Tim Hughey
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 request and response messages.
//!
//! The control channel speaks plain HTTP semantics; event pushes reuse the
//! same connection distinguished only by the `EVENT/1.0` protocol line.

use crate::Error;
use bytes::{Bytes, BytesMut};
use std::fmt;

pub mod codec;

pub const CONTENT_TLV8: &str = "application/pairing+tlv8";
pub const CONTENT_JSON: &str = "application/hap+json";

/// Largest header + body a client may send before being cut off.
const REQUEST_LEN_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

impl Method {
    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            _ => Err(Error::MalformedRecord("unsupported method")),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Put => write!(f, "PUT"),
            Self::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: Bytes,
}

impl Request {
    /// Incremental parse from an accumulation buffer. `Ok(None)` means more
    /// bytes are needed; consumed bytes are split off `buf` only once a
    /// complete message is present.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Request>, Error> {
        let Some(header_end) = find_header_end(buf) else {
            if buf.len() > REQUEST_LEN_MAX {
                return Err(Error::MalformedRecord("header section too large"));
            }

            return Ok(None);
        };

        // headers are ASCII; tolerate nothing else
        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| Error::MalformedRecord("non-ascii header section"))?;

        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or(Error::MalformedRecord("empty request line"))?;

        let mut parts = request_line.split_ascii_whitespace();
        let (method, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(p)) => (m, t, p),
            _ => return Err(Error::MalformedRecord("invalid request line")),
        };

        if !protocol.starts_with("HTTP/1.") {
            return Err(Error::MalformedRecord("unsupported protocol"));
        }

        let method = Method::parse(method)?;

        let mut content_len = 0usize;
        for line in lines.filter(|l| !l.is_empty()) {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_len = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::MalformedRecord("invalid content length"))?;
                }
            }
        }

        if content_len > REQUEST_LEN_MAX {
            return Err(Error::MalformedRecord("body too large"));
        }

        let body_start = header_end + 4;
        if buf.len() < body_start + content_len {
            return Ok(None); // body still inbound
        }

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };

        let mut message = buf.split_to(body_start + content_len);
        let body = message.split_off(body_start).freeze();

        Ok(Some(Request {
            method,
            path,
            query,
            body,
        }))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;

        if let Some(query) = self.query.as_deref() {
            write!(f, "?{query}")?;
        }

        write!(f, " ({} body bytes)", self.body.len())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Reply to a request on this connection.
    Response,
    /// Unsolicited push for a subscribed characteristic change.
    Event,
}

#[derive(Debug)]
pub struct Content {
    pub kind: &'static str,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub kind: Kind,
    pub content: Option<Content>,
}

impl Response {
    #[must_use]
    pub fn ok_tlv8(tags: crate::Tags) -> Self {
        Self {
            status: 200,
            kind: Kind::Response,
            content: Some(Content {
                kind: CONTENT_TLV8,
                data: tags.encode().freeze(),
            }),
        }
    }

    #[must_use]
    pub fn ok_json(data: Vec<u8>) -> Self {
        Self::json(200, data)
    }

    #[must_use]
    pub fn multi_status_json(data: Vec<u8>) -> Self {
        Self::json(207, data)
    }

    #[must_use]
    pub fn json(status: u16, data: Vec<u8>) -> Self {
        Self {
            status,
            kind: Kind::Response,
            content: Some(Content {
                kind: CONTENT_JSON,
                data: data.into(),
            }),
        }
    }

    #[must_use]
    pub fn no_content() -> Self {
        Self::empty(204)
    }

    #[must_use]
    pub fn bad_request() -> Self {
        Self::empty(400)
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::empty(404)
    }

    /// Authenticated-only route hit while unverified. The connection
    /// stays open so the client can still complete pair-verify.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self::empty(470)
    }

    #[must_use]
    pub fn internal_server_error() -> Self {
        Self::empty(500)
    }

    /// Out-of-band push on an already verified connection.
    #[must_use]
    pub fn event_json(data: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            kind: Kind::Event,
            content: Some(Content {
                kind: CONTENT_JSON,
                data: data.into(),
            }),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            kind: Kind::Response,
            content: None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            204 => "No Content",
            207 => "Multi-Status",
            400 => "Bad Request",
            404 => "Not Found",
            470 => "Connection Authorization Required",
            _ => "Internal Server Error",
        }
    }
}
