//! Structural combinators (`spec.md` §4.5): framing built from one or more
//! inner packets rather than raw bytes directly.

use std::rc::Rc;

use async_trait::async_trait;

use crate::context::{Context, CtxParam, FromValue, IntoValue, Value};
use crate::dependent::const_field;
use crate::error::{Error, Result};
use crate::integral::Bytes;
use crate::packet::{Packet, PacketRef};
use crate::stream::{InMemoryStream, Stream};

/// `SizePrefixed(size_field, body)`: on encode, `body` is encoded first (to
/// deduce its byte length), then the size prefix and body are written; on
/// decode, the size is read, then exactly that many bytes are consumed into
/// a bounded substream for `body` — an unread remainder in that substream
/// is a decode error.
pub struct SizePrefixed<S, B>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    size_field: PacketRef<S>,
    body: PacketRef<B>,
}

impl<S, B> SizePrefixed<S, B>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    pub fn new(size_field: PacketRef<S>, body: PacketRef<B>) -> PacketRef<B> {
        Rc::new(SizePrefixed { size_field, body })
    }
}

#[async_trait(?Send)]
impl<S, B> Packet<B> for SizePrefixed<S, B>
where
    S: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &B, ctx: &Context) -> Result<()> {
        let body_ctx = ctx.make_child(Some("data"));
        let mut scratch = InMemoryStream::new();
        self.body.encode_impl(&mut scratch, value, &body_ctx).await?;
        let body_bytes = body_ctx.encoded().unwrap_or_else(|| scratch.get_data());

        let size_val: S = body_bytes
            .len()
            .try_into()
            .map_err(|_| Error::encode("body too long for its size field"))?;

        let size_ctx = ctx.make_child(Some("size"));
        self.size_field.encode_impl(stream, &size_val, &size_ctx).await?;
        let size_bytes = size_ctx.encoded().unwrap_or_default();

        stream.send(&body_bytes).await?;

        let mut combined = size_bytes;
        combined.extend_from_slice(&body_bytes);
        ctx.register_enc(combined);
        Ok(())
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<B> {
        let size_ctx = ctx.make_child(Some("size"));
        let size_val = self.size_field.decode_impl(stream, &size_ctx).await?;
        let size_bytes = size_ctx.encoded().unwrap_or_default();

        let len: usize = size_val
            .try_into()
            .map_err(|_| Error::decode("size field value out of range"))?;
        let body_bytes = crate::stream::recv_exact(stream, len).await?;

        let body_ctx = ctx.make_child(Some("data"));
        let mut body_stream = InMemoryStream::with_data(body_bytes.clone());
        let value = self.body.decode_impl(&mut body_stream, &body_ctx).await?;
        if !body_stream.at_eof() {
            return Err(Error::decode(
                "size-prefixed body left unread trailing bytes",
            ));
        }

        let mut combined = size_bytes;
        combined.extend_from_slice(&body_bytes);
        ctx.register_enc(combined);

        Ok(value)
    }
}

/// `CountPrefixed(count_field, body_fn, len_fn)`: the count prefix is
/// deduced from `len_fn(&value)`; `body_fn(count)` builds the packet for
/// the body once the count is known (at both encode and decode time).
pub struct CountPrefixed<C, B>
where
    C: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    count_field: PacketRef<C>,
    body_fn: Rc<dyn Fn(usize) -> PacketRef<B>>,
    len_fn: Rc<dyn Fn(&B) -> usize>,
}

impl<C, B> CountPrefixed<C, B>
where
    C: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    pub fn new(
        count_field: PacketRef<C>,
        body_fn: impl Fn(usize) -> PacketRef<B> + 'static,
        len_fn: impl Fn(&B) -> usize + 'static,
    ) -> PacketRef<B> {
        Rc::new(CountPrefixed {
            count_field,
            body_fn: Rc::new(body_fn),
            len_fn: Rc::new(len_fn),
        })
    }
}

#[async_trait(?Send)]
impl<C, B> Packet<B> for CountPrefixed<C, B>
where
    C: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
    B: Clone + IntoValue + FromValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &B, ctx: &Context) -> Result<()> {
        let count = (self.len_fn)(value);
        let count_val: C = count
            .try_into()
            .map_err(|_| Error::encode("count too large for its count field"))?;

        let count_ctx = ctx.make_child(Some("count"));
        self.count_field.encode_impl(stream, &count_val, &count_ctx).await?;
        let count_bytes = count_ctx.encoded().unwrap_or_default();

        let body_packet = (self.body_fn)(count);
        let body_ctx = ctx.make_child(Some("data"));
        body_packet.encode_impl(stream, value, &body_ctx).await?;
        let body_bytes = body_ctx.encoded().unwrap_or_default();

        let mut combined = count_bytes;
        combined.extend_from_slice(&body_bytes);
        ctx.register_enc(combined);
        Ok(())
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<B> {
        let count_ctx = ctx.make_child(Some("count"));
        let count_val = self.count_field.decode_impl(stream, &count_ctx).await?;
        let count_bytes = count_ctx.encoded().unwrap_or_default();

        let count: usize = count_val
            .try_into()
            .map_err(|_| Error::decode("count field value out of range"))?;

        let body_packet = (self.body_fn)(count);
        let body_ctx = ctx.make_child(Some("data"));
        let value = body_packet.decode_impl(stream, &body_ctx).await?;
        let body_bytes = body_ctx.encoded().unwrap_or_default();

        if (self.len_fn)(&value) != count {
            return Err(Error::decode(
                "decoded body length does not match the count prefix",
            ));
        }

        let mut combined = count_bytes;
        combined.extend_from_slice(&body_bytes);
        ctx.register_enc(combined);

        Ok(value)
    }
}

/// [`CountPrefixed`] specialized to a raw byte-string body (`spec.md` §8
/// scenario 4).
pub fn count_prefixed_bytes<C>(count_field: PacketRef<C>) -> PacketRef<Vec<u8>>
where
    C: Clone + IntoValue + FromValue + Copy + TryFrom<usize> + TryInto<usize> + 'static,
{
    CountPrefixed::new(count_field, |count: usize| Bytes::new(count), |v: &Vec<u8>| v.len())
}

/// `Padded(body, size)`: `body` followed by zero bytes up to `size(ctx)`;
/// encoding a body that already exceeds `size` is an error.
pub struct Padded<B: Clone + IntoValue + 'static> {
    body: PacketRef<B>,
    size: CtxParam<usize>,
}

impl<B: Clone + IntoValue + 'static> Padded<B> {
    pub fn new(body: PacketRef<B>, size: impl Into<CtxParam<usize>>) -> PacketRef<B> {
        Rc::new(Padded {
            body,
            size: size.into(),
        })
    }
}

#[async_trait(?Send)]
impl<B: Clone + IntoValue + 'static> Packet<B> for Padded<B> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &B, ctx: &Context) -> Result<()> {
        let size = self.size.eval(ctx)?;

        let mut scratch = InMemoryStream::new();
        self.body.encode_impl(&mut scratch, value, ctx).await?;
        let mut data = ctx.encoded().unwrap_or_else(|| scratch.get_data());

        if data.len() > size {
            return Err(Error::encode(format!(
                "padded body ({} bytes) exceeds the declared size ({size})",
                data.len()
            )));
        }
        data.resize(size, 0);

        let data = ctx.register_enc(data);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<B> {
        let size = self.size.eval(ctx)?;
        let region = crate::stream::recv_exact(stream, size).await?;

        let mut sub = InMemoryStream::with_data(region.clone());
        let value = self.body.decode_impl(&mut sub, ctx).await?;

        ctx.register_enc(region);
        Ok(value)
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.size.eval(ctx)
    }
}

/// `Aligned(body, alignment)`: `body` followed by zero bytes up to the next
/// multiple of `alignment(ctx)`.
pub struct Aligned<B: Clone + IntoValue + 'static> {
    body: PacketRef<B>,
    alignment: CtxParam<usize>,
}

impl<B: Clone + IntoValue + 'static> Aligned<B> {
    pub fn new(body: PacketRef<B>, alignment: impl Into<CtxParam<usize>>) -> PacketRef<B> {
        Rc::new(Aligned {
            body,
            alignment: alignment.into(),
        })
    }
}

fn next_multiple(len: usize, alignment: usize) -> usize {
    if alignment == 0 {
        len
    } else {
        len.div_ceil(alignment) * alignment
    }
}

#[async_trait(?Send)]
impl<B: Clone + IntoValue + 'static> Packet<B> for Aligned<B> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &B, ctx: &Context) -> Result<()> {
        let mut scratch = InMemoryStream::new();
        self.body.encode_impl(&mut scratch, value, ctx).await?;
        let mut data = ctx.encoded().unwrap_or_else(|| scratch.get_data());

        let alignment = self.alignment.eval(ctx)?;
        let target = next_multiple(data.len(), alignment);
        data.resize(target, 0);

        let data = ctx.register_enc(data);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<B> {
        let value = self.body.decode_impl(stream, ctx).await?;
        let body_bytes = ctx.encoded().unwrap_or_default();

        let alignment = self.alignment.eval(ctx)?;
        let target = next_multiple(body_bytes.len(), alignment);
        let pad_len = target - body_bytes.len();

        let padding = crate::stream::recv_exact(stream, pad_len).await?;
        if padding.iter().any(|&b| b != 0) {
            return Err(Error::decode("alignment padding contains non-zero bytes"));
        }

        let mut combined = body_bytes;
        combined.extend_from_slice(&padding);
        ctx.register_enc(combined);

        Ok(value)
    }
}

/// `Array(item, count)`: `count(ctx)` identical items, addressable by
/// stringified index (`ctx.members["0"]`, `["1"]`, ...).
pub struct Array<T: Clone + IntoValue + 'static> {
    item: PacketRef<T>,
    count: CtxParam<usize>,
}

impl<T: Clone + IntoValue + 'static> Array<T> {
    pub fn new(item: PacketRef<T>, count: impl Into<CtxParam<usize>>) -> PacketRef<Vec<T>> {
        Rc::new(Array {
            item,
            count: count.into(),
        })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<Vec<T>> for Array<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Vec<T>, ctx: &Context) -> Result<()> {
        let count = self.count.eval(ctx)?;
        if value.len() != count {
            return Err(Error::encode(format!(
                "array has {} items, expected {count}",
                value.len()
            )));
        }

        let mut combined = Vec::new();
        for (i, item_value) in value.iter().enumerate() {
            let name = i.to_string();
            let child = ctx.make_child(Some(&name));
            self.item.encode_impl(stream, item_value, &child).await?;
            combined.extend(child.encoded().unwrap_or_default());
        }

        ctx.register_enc(combined);
        Ok(())
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Vec<T>> {
        let count = self.count.eval(ctx)?;
        let mut items = Vec::with_capacity(count);
        let mut combined = Vec::new();

        for i in 0..count {
            let name = i.to_string();
            let child = ctx.make_child(Some(&name));
            let value = self.item.decode_impl(stream, &child).await?;
            combined.extend(child.encoded().unwrap_or_default());
            items.push(value);
        }

        ctx.register_enc(combined);
        Ok(items)
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        let count = self.count.eval(ctx)?;
        let item_size = self.item.size_impl(ctx)?;
        Ok(item_size * count)
    }
}

/// `Transformed(inner, dec_size, dec_fn, enc_fn)`: encodes `inner` to a
/// scratch buffer and runs `enc_fn` over the result before writing it;
/// decodes `dec_size(ctx)` bytes (or all remaining, if `None`) and runs
/// `dec_fn` over them before handing the result to `inner`.
pub struct Transformed<T: Clone + IntoValue + 'static> {
    inner: PacketRef<T>,
    dec_size: Option<CtxParam<usize>>,
    dec_fn: Rc<dyn Fn(&[u8]) -> Result<Vec<u8>>>,
    enc_fn: Rc<dyn Fn(&[u8]) -> Result<Vec<u8>>>,
}

impl<T: Clone + IntoValue + 'static> Transformed<T> {
    pub fn new(
        inner: PacketRef<T>,
        dec_size: Option<CtxParam<usize>>,
        dec_fn: impl Fn(&[u8]) -> Result<Vec<u8>> + 'static,
        enc_fn: impl Fn(&[u8]) -> Result<Vec<u8>> + 'static,
    ) -> PacketRef<T> {
        Rc::new(Transformed {
            inner,
            dec_size,
            dec_fn: Rc::new(dec_fn),
            enc_fn: Rc::new(enc_fn),
        })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<T> for Transformed<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        let mut scratch = InMemoryStream::new();
        self.inner.encode_impl(&mut scratch, value, ctx).await?;
        let raw = ctx.encoded().unwrap_or_else(|| scratch.get_data());

        let transformed = (self.enc_fn)(&raw)?;
        let transformed = ctx.register_enc(transformed);
        stream.send(&transformed).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        let raw_bytes = match &self.dec_size {
            Some(size_param) => {
                let n = size_param.eval(ctx)?;
                crate::stream::recv_exact(stream, n).await?
            }
            None => stream.recv(None, true).await?,
        };

        let transformed = (self.dec_fn)(&raw_bytes)?;
        let mut sub = InMemoryStream::with_data(transformed);
        let value = self.inner.decode_impl(&mut sub, ctx).await?;

        ctx.register_enc(raw_bytes);
        Ok(value)
    }
}

/// A field whose value is `compute_fn(hash_fn(data_expr(ctx)))`, validated
/// on both encode and decode (`spec.md` §4.5). Typically wrapped in
/// [`crate::packet::PacketExt::postponed`] so `data_expr` can read sibling
/// `encoded` slices that come later in declaration order.
pub fn checksum<T>(
    inner: PacketRef<T>,
    data_expr: impl Fn(&Context) -> Result<Vec<u8>> + 'static,
    hash_fn: impl Fn(&[u8]) -> u64 + 'static,
    compute_fn: impl Fn(u64) -> Value + 'static,
) -> PacketRef<Value>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    const_field(inner, move |ctx: &Context| {
        let data = data_expr(ctx)?;
        Ok(compute_fn(hash_fn(&data)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::{byte, u8 as fixed_u8, var_int};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn size_prefixed_matches_declared_length_invariant() {
        let p = SizePrefixed::new(fixed_u8(), byte());
        let bytes = p.encode_to_bytes(&vec![0x41]).await.unwrap();
        assert_eq!(bytes, vec![1, 0x41]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), vec![0x41]);
    }

    #[tokio::test]
    async fn count_prefixed_bytes_matches_spec_scenario() {
        let p = count_prefixed_bytes(var_int());
        let bytes = p.encode_to_bytes(&b"Abel is the best!".to_vec()).await.unwrap();
        assert_eq!(bytes[0], 0x11);
        assert_eq!(&bytes[1..], b"Abel is the best!");
        assert_eq!(
            p.decode_from_bytes(&bytes, true).await.unwrap(),
            b"Abel is the best!".to_vec()
        );
    }

    #[tokio::test]
    async fn padded_pads_and_rejects_overflow() {
        let p = Padded::new(byte(), 4usize);
        let bytes = p.encode_to_bytes(&vec![9]).await.unwrap();
        assert_eq!(bytes, vec![9, 0, 0, 0]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), vec![9]);

        let too_big = Padded::new(Bytes::new(5usize), 4usize);
        assert!(too_big.encode_to_bytes(&vec![0; 5]).await.is_err());
    }

    #[tokio::test]
    async fn array_round_trips_fixed_items() {
        let p = Array::new(fixed_u8(), 3usize);
        let bytes = p.encode_to_bytes(&vec![1, 2, 3]).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(p.size(None).unwrap(), 3);
    }

    #[tokio::test]
    async fn transformed_invokes_enc_and_dec_fns() {
        let flip = |b: &[u8]| -> Result<Vec<u8>> { Ok(b.iter().map(|x| !x).collect()) };
        let p = Transformed::new(byte(), Some(CtxParam::Fixed(1)), flip, flip);
        let bytes = p.encode_to_bytes(&vec![0x00]).await.unwrap();
        assert_eq!(bytes, vec![0xff]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), vec![0x00]);
    }
}
