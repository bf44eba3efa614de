//! String packets (`spec.md` §4.4). All four variants are generic over a
//! [`Encoding`], defaulting to UTF-8 — the only codec exercised by the
//! source this crate distills, with the trait left as a seam for others.

use std::rc::Rc;

use async_trait::async_trait;

use crate::context::{Context, CtxParam, FromValue, IntoValue};
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketRef};
use crate::stream::Stream;

/// A text codec a string packet encodes/decodes through. `Utf8` is the only
/// implementation this crate ships; user crates may supply their own.
pub trait Encoding {
    fn encode_str(&self, s: &str) -> Result<Vec<u8>>;
    fn decode_bytes(&self, bytes: &[u8]) -> Result<String>;
}

/// Strict UTF-8 (a superset of ASCII). Invalid bytes are a decode error.
pub struct Utf8;

impl Encoding for Utf8 {
    fn encode_str(&self, s: &str) -> Result<Vec<u8>> {
        Ok(s.as_bytes().to_vec())
    }

    fn decode_bytes(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::decode(format!("invalid utf-8: {e}")))
    }
}

fn default_encoding() -> Rc<dyn Encoding> {
    Rc::new(Utf8)
}

/// A string placed in a fixed-size byte region, null-padded to the right.
pub struct PaddedString {
    size: CtxParam<usize>,
    encoding: Rc<dyn Encoding>,
}

impl PaddedString {
    pub fn new(size: impl Into<CtxParam<usize>>) -> PacketRef<String> {
        Rc::new(PaddedString {
            size: size.into(),
            encoding: default_encoding(),
        })
    }

    pub fn with_encoding(size: impl Into<CtxParam<usize>>, encoding: Rc<dyn Encoding>) -> PacketRef<String> {
        Rc::new(PaddedString {
            size: size.into(),
            encoding,
        })
    }
}

#[async_trait(?Send)]
impl Packet<String> for PaddedString {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &String, ctx: &Context) -> Result<()> {
        let text_bytes = self.encoding.encode_str(value)?;
        let size = self.size.eval(ctx)?;

        if text_bytes.len() > size {
            return Err(Error::encode(format!(
                "encoded string ({} bytes) does not fit in the declared size ({size})",
                text_bytes.len()
            )));
        }

        let mut data = text_bytes;
        data.resize(size, 0);

        let data = ctx.register_enc(data);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<String> {
        let size = self.size.eval(ctx)?;
        let data = ctx.register_enc(crate::stream::recv_exact(stream, size).await?);

        let trimmed_len = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
        self.encoding.decode_bytes(&data[..trimmed_len])
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.size.eval(ctx)
    }
}

/// Text followed by a single NUL terminator.
pub struct CString {
    encoding: Rc<dyn Encoding>,
}

impl CString {
    pub fn new() -> PacketRef<String> {
        Rc::new(CString {
            encoding: default_encoding(),
        })
    }

    pub fn with_encoding(encoding: Rc<dyn Encoding>) -> PacketRef<String> {
        Rc::new(CString { encoding })
    }
}

/// Convenience free function, matching the teacher's style of exposing a
/// bare function alongside each type's `::new`.
pub fn c_string() -> PacketRef<String> {
    CString::new()
}

#[async_trait(?Send)]
impl Packet<String> for CString {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &String, ctx: &Context) -> Result<()> {
        let mut data = self.encoding.encode_str(value)?;
        if data.contains(&0u8) {
            return Err(Error::encode("string contains an embedded NUL byte"));
        }
        data.push(0);

        let data = ctx.register_enc(data);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<String> {
        let mut data = Vec::new();

        loop {
            let byte = crate::stream::recv_exact(stream, 1).await?;
            if byte[0] == 0 {
                break;
            }
            data.push(byte[0]);
        }

        let text = self.encoding.decode_bytes(&data)?;

        let mut encoded = data;
        encoded.push(0);
        ctx.register_enc(encoded);

        Ok(text)
    }
}

/// Encodes/decodes the remainder of the stream as text.
pub struct GreedyString {
    encoding: Rc<dyn Encoding>,
}

impl GreedyString {
    pub fn new() -> PacketRef<String> {
        Rc::new(GreedyString {
            encoding: default_encoding(),
        })
    }
}

pub fn greedy_string() -> PacketRef<String> {
    GreedyString::new()
}

#[async_trait(?Send)]
impl Packet<String> for GreedyString {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &String, ctx: &Context) -> Result<()> {
        let data = ctx.register_enc(self.encoding.encode_str(value)?);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<String> {
        let data = ctx.register_enc(stream.recv(None, true).await?);
        self.encoding.decode_bytes(&data)
    }
}

/// A length-prefixed greedy string, where the prefix is any integer packet
/// `S` convertible to/from `usize`.
pub struct PascalString<S>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
{
    size_field: PacketRef<S>,
    encoding: Rc<dyn Encoding>,
}

impl<S> PascalString<S>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
{
    pub fn new(size_field: PacketRef<S>) -> PacketRef<String> {
        Rc::new(PascalString {
            size_field,
            encoding: default_encoding(),
        })
    }
}

#[async_trait(?Send)]
impl<S> Packet<String> for PascalString<S>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &String, ctx: &Context) -> Result<()> {
        let text_bytes = self.encoding.encode_str(value)?;
        let size_val: S = text_bytes
            .len()
            .try_into()
            .map_err(|_| Error::encode("string too long for its size field"))?;

        let child = ctx.make_child(Some("size"));
        self.size_field.encode_impl(stream, &size_val, &child).await?;
        let mut combined = child.encoded().unwrap_or_default();

        stream.send(&text_bytes).await?;
        combined.extend_from_slice(&text_bytes);
        ctx.register_enc(combined);

        Ok(())
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<String> {
        let child = ctx.make_child(Some("size"));
        let size_val = self.size_field.decode_impl(stream, &child).await?;
        let mut combined = child.encoded().unwrap_or_default();

        let len: usize = size_val
            .try_into()
            .map_err(|_| Error::decode("size field value out of range"))?;
        let text_bytes = crate::stream::recv_exact(stream, len).await?;
        let text = self.encoding.decode_bytes(&text_bytes)?;

        combined.extend_from_slice(&text_bytes);
        ctx.register_enc(combined);

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::u8 as fixed_u8;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn padded_string_pads_and_strips_nuls() {
        let p = PaddedString::new(8usize);
        let bytes = p.encode_to_bytes(&"Hi".to_string()).await.unwrap();
        assert_eq!(bytes, b"Hi\0\0\0\0\0\0");
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), "Hi");
    }

    #[tokio::test]
    async fn padded_string_rejects_overflow() {
        let p = PaddedString::new(1usize);
        assert!(p.encode_to_bytes(&"Hi".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn c_string_round_trips() {
        let p = c_string();
        let bytes = p.encode_to_bytes(&"Hi".to_string()).await.unwrap();
        assert_eq!(bytes, b"Hi\0");
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), "Hi");
    }

    #[tokio::test]
    async fn greedy_string_reads_to_eof() {
        let p = greedy_string();
        assert_eq!(
            p.decode_from_bytes("hello".as_bytes(), true).await.unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn pascal_string_round_trips() {
        let p = PascalString::new(fixed_u8());
        let bytes = p
            .encode_to_bytes(&"Abel is the best!".to_string())
            .await
            .unwrap();
        assert_eq!(bytes[0], 17);
        assert_eq!(&bytes[1..], b"Abel is the best!");
        assert_eq!(
            p.decode_from_bytes(&bytes, true).await.unwrap(),
            "Abel is the best!"
        );
    }
}
