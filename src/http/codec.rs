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

//! [`Decoder`] / [`Encoder`] for the control channel.
//!
//! Until pair-verify completes the stream is plain HTTP. Once the session
//! cipher is installed every inbound frame is authenticated and decrypted
//! before request parsing, and every outbound message is encrypted after
//! encoding. A decrypt failure propagates as an error, which tears the
//! connection down; receive nonce state cannot be rewound.
//!
//! [`Decoder`]: tokio_util::codec::Decoder
//! [`Encoder`]: tokio_util::codec::Encoder

use crate::{
    cipher::{BlockLen, Context as CipherCtx, Lock as CipherLock},
    http::{Kind, Request, Response},
    Result,
};
use bytes::{Buf, BytesMut};
use std::sync::{Arc, RwLock};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct Hap {
    cipher: CipherLock,
    clear: BytesMut,
}

impl Hap {
    pub fn install_cipher(&mut self, ctx: CipherCtx) {
        self.cipher = Some(Arc::new(RwLock::new(ctx)));
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

impl Decoder for Hap {
    type Item = Request;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(cipher) = self.cipher.as_ref() {
            // drain every complete frame the buffer holds
            while BlockLen::have_min_bytes(buf.len()) {
                let block_len = BlockLen(u16::from_le_bytes([buf[0], buf[1]]));

                if block_len.need_more(buf.len() - 2) {
                    break; // partial frame, wait for the rest
                }

                buf.advance(2);
                let frame = buf.split_to(block_len.len_with_auth_tag());

                let decrypted = cipher.write().unwrap().decrypt(frame, *block_len)?;
                self.clear.extend_from_slice(&decrypted);
            }
        } else {
            // clear text mode; only the handshakes travel this way
            self.clear.extend_from_slice(&buf.split());
        }

        Ok(Request::decode(&mut self.clear)?)
    }
}

impl Encoder<Response> for Hap {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<()> {
        use std::fmt::Write;

        let protocol = match item.kind {
            Kind::Response => "HTTP/1.1",
            Kind::Event => "EVENT/1.0",
        };

        write!(dst, "{protocol} {} {}\r\n", item.status, item.reason())?;

        if let Some(content) = item.content {
            write!(dst, "Content-Type: {}\r\n", content.kind)?;
            write!(dst, "Content-Length: {}\r\n", content.data.len())?;
            write!(dst, "\r\n")?;
            dst.extend_from_slice(&content.data);
        } else {
            write!(dst, "\r\n")?;
        }

        if let Some(cipher) = self.cipher.as_ref() {
            let cleartext = dst.split();
            let encrypted = cipher.write().unwrap().encrypt(cleartext)?;

            dst.unsplit(encrypted);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Hap;
    use crate::{
        cipher::Context as CipherCtx,
        http::{Method, Response},
        Tags,
    };
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn clear_text_request_decodes() {
        let mut codec = Hap::default();
        let mut buf = BytesMut::from("POST /pair-setup HTTP/1.1\r\nContent-Length: 0\r\n\r\n");

        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/pair-setup");
        assert!(!codec.is_encrypted());
    }

    #[test]
    fn clear_text_response_encodes() {
        let mut codec = Hap::default();
        let mut dst = BytesMut::new();

        codec
            .encode(Response::ok_tlv8(Tags::default()), &mut dst)
            .unwrap();

        let text = String::from_utf8_lossy(&dst);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/pairing+tlv8\r\n"));
    }

    #[test]
    fn encrypted_roundtrip_through_installed_cipher() {
        let secret = [0x21u8; 32];

        // accessory side encodes a response
        let mut accessory = Hap::default();
        accessory.install_cipher(CipherCtx::new(&secret));

        let mut wire = BytesMut::new();
        accessory
            .encode(Response::no_content(), &mut wire)
            .unwrap();

        // the wire bytes are not recognizable HTTP
        assert_ne!(&wire[..8], b"HTTP/1.1".as_slice());

        // a controller-keyed cipher reads them back
        let mut controller = CipherCtx::controller(&secret);
        let block_len = u16::from_le_bytes([wire[0], wire[1]]);
        let clear = controller
            .decrypt(wire.split_off(2), block_len)
            .unwrap();

        assert!(clear.starts_with(b"HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn encrypted_request_decodes() {
        let secret = [0x22u8; 32];

        let mut accessory = Hap::default();
        accessory.install_cipher(CipherCtx::new(&secret));

        // controller encrypts a request with its write key
        let mut controller = CipherCtx::controller(&secret);
        let mut wire = controller
            .encrypt(BytesMut::from("GET /accessories HTTP/1.1\r\n\r\n"))
            .unwrap();

        let req = accessory.decode(&mut wire).unwrap().unwrap();
        assert_eq!(req.path, "/accessories");
    }

    #[test]
    fn tampered_frame_errors_out() {
        let secret = [0x23u8; 32];

        let mut accessory = Hap::default();
        accessory.install_cipher(CipherCtx::new(&secret));

        let mut controller = CipherCtx::controller(&secret);
        let mut wire = controller
            .encrypt(BytesMut::from("GET /accessories HTTP/1.1\r\n\r\n"))
            .unwrap();

        let n = wire.len() - 1;
        wire[n] ^= 0x40;

        assert!(accessory.decode(&mut wire).is_err());
    }

    #[test]
    fn event_uses_its_own_protocol_line() {
        let mut codec = Hap::default();
        let mut dst = BytesMut::new();

        codec
            .encode(Response::event_json(b"{}".to_vec()), &mut dst)
            .unwrap();

        assert!(dst.starts_with(b"EVENT/1.0 200 OK\r\n"));
    }
}
