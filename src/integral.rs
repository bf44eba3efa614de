//! Integral and byte packets (`spec.md` §4.3): fixed-width integers in
//! three endianness variants, arbitrary-width `BytesInt`, unsigned LEB128
//! `VarInt`, `ZigZag`, IEEE-754 floats, and `Bytes`/`GreedyBytes`.

use std::marker::PhantomData;
use std::rc::Rc;

use async_trait::async_trait;

use crate::context::{Context, IntoValue};
use crate::error::{Error, Result};
use crate::packet::{Adapter, Packet, PacketRef};
use crate::stream::Stream;

/// Byte order for fixed-width integers and floats. `Network` is identical to
/// `Big` (`spec.md` §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub const NETWORK: Endian = Endian::Big;
}

/// Implemented by every primitive integer type fixed-width packets can
/// carry, so [`FixedInt`] needs only one generic body.
pub trait IntCodec: Sized + Copy {
    const SIZE: usize;

    fn from_bytes(buf: &[u8], endian: Endian) -> Self;
    fn to_bytes(self, endian: Endian) -> Vec<u8>;
}

macro_rules! impl_int_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntCodec for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_bytes(buf: &[u8], endian: Endian) -> Self {
                    let mut arr = [0u8; std::mem::size_of::<$ty>()];
                    arr.copy_from_slice(buf);
                    match endian {
                        Endian::Little => <$ty>::from_le_bytes(arr),
                        Endian::Big => <$ty>::from_be_bytes(arr),
                    }
                }

                fn to_bytes(self, endian: Endian) -> Vec<u8> {
                    match endian {
                        Endian::Little => self.to_le_bytes().to_vec(),
                        Endian::Big => self.to_be_bytes().to_vec(),
                    }
                }
            }
        )*
    };
}

impl_int_codec!(i8, u8, i16, u16, i32, u32, i64, u64, i128, u128);

/// A statically-sized signed/unsigned integer of a fixed byte order.
pub struct FixedInt<T> {
    endian: Endian,
    _marker: PhantomData<T>,
}

impl<T> FixedInt<T> {
    pub fn new(endian: Endian) -> PacketRef<T>
    where
        T: IntCodec + Clone + IntoValue + 'static,
    {
        Rc::new(FixedInt {
            endian,
            _marker: PhantomData,
        })
    }
}

#[async_trait(?Send)]
impl<T> Packet<T> for FixedInt<T>
where
    T: IntCodec + Clone + IntoValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        let data = ctx.register_enc(value.to_bytes(self.endian));
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        let data = ctx.register_enc(crate::stream::recv_exact(stream, T::SIZE).await?);
        Ok(T::from_bytes(&data, self.endian))
    }

    fn size_impl(&self, _ctx: &Context) -> Result<usize> {
        Ok(T::SIZE)
    }
}

macro_rules! def_fixed_int_family {
    ($ty:ty, $prefix:ident) => {
        paste::paste! {
            #[doc = concat!("Little-endian ", stringify!($ty), ".")]
            pub fn [<$prefix l>]() -> PacketRef<$ty> {
                FixedInt::new(Endian::Little)
            }

            #[doc = concat!("Big-endian ", stringify!($ty), ".")]
            pub fn [<$prefix b>]() -> PacketRef<$ty> {
                FixedInt::new(Endian::Big)
            }

            #[doc = concat!("Network-order (= big-endian) ", stringify!($ty), ".")]
            pub fn [<$prefix _le>]() -> PacketRef<$ty> {
                [<$prefix l>]()
            }

            #[doc = concat!("Default (network) order ", stringify!($ty), ".")]
            pub fn $prefix() -> PacketRef<$ty> {
                FixedInt::new(Endian::NETWORK)
            }
        }
    };
}

def_fixed_int_family!(i8, i8);
def_fixed_int_family!(u8, u8);
def_fixed_int_family!(i16, i16);
def_fixed_int_family!(u16, u16);
def_fixed_int_family!(i32, i32);
def_fixed_int_family!(u32, u32);
def_fixed_int_family!(i64, i64);
def_fixed_int_family!(u64, u64);

/// `BytesInt(size, signed, endianness)`: an arbitrary byte-length integer,
/// represented as `i128` (signed) so both directions share one
/// implementation; callers needing more than 16 bytes of precision should
/// compose their own `Bytes` + manual conversion instead.
pub struct BytesInt {
    size: usize,
    signed: bool,
    endian: Endian,
}

impl BytesInt {
    pub fn new(size: usize, signed: bool, endian: Endian) -> PacketRef<i128> {
        Rc::new(BytesInt {
            size,
            signed,
            endian,
        })
    }
}

#[async_trait(?Send)]
impl Packet<i128> for BytesInt {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &i128, ctx: &Context) -> Result<()> {
        if !self.signed && *value < 0 {
            return Err(Error::encode("BytesInt is unsigned but value is negative"));
        }

        let full = value.to_be_bytes(); // 16 bytes, big-endian, two's complement
        if self.size > full.len() {
            return Err(Error::encode("BytesInt size exceeds i128 precision"));
        }

        let significant = &full[full.len() - self.size..];
        // Reject silent truncation of the magnitude.
        let reconstructed = {
            let mut buf = [0u8; 16];
            buf[16 - self.size..].copy_from_slice(significant);
            if *value < 0 {
                for b in buf[..16 - self.size].iter_mut() {
                    *b = 0xff;
                }
            }
            i128::from_be_bytes(buf)
        };
        if reconstructed != *value {
            return Err(Error::encode("value does not fit in the declared byte size"));
        }

        let mut out = significant.to_vec();
        if self.endian == Endian::Little {
            out.reverse();
        }

        let out = ctx.register_enc(out);
        stream.send(&out).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<i128> {
        let mut data = ctx.register_enc(crate::stream::recv_exact(stream, self.size).await?);
        if self.endian == Endian::Little {
            data.reverse();
        }

        let negative = self.signed && self.size > 0 && data[0] & 0x80 != 0;
        let mut buf = [if negative { 0xffu8 } else { 0 }; 16];
        buf[16 - self.size..].copy_from_slice(&data);

        Ok(i128::from_be_bytes(buf))
    }

    fn size_impl(&self, _ctx: &Context) -> Result<usize> {
        Ok(self.size)
    }
}

/// Unsigned LEB128: 7-bit groups, little-endian, continuation bit `0x80` on
/// all but the last byte. Rejects negative input.
pub struct VarInt;

impl VarInt {
    pub fn new() -> PacketRef<u64> {
        Rc::new(VarInt)
    }
}

/// Convenience constructor, the `VarInt` family's counterpart to `u32()`
/// et al.
pub fn var_int() -> PacketRef<u64> {
    VarInt::new()
}

#[async_trait(?Send)]
impl Packet<u64> for VarInt {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &u64, ctx: &Context) -> Result<()> {
        let mut data = Vec::new();
        let mut v = *value;

        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            data.push(byte);
            if v == 0 {
                break;
            }
        }

        let data = ctx.register_enc(data);
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<u64> {
        let mut encoded = Vec::new();
        let mut result: u64 = 0;
        let mut shift = 0u32;

        loop {
            let byte = crate::stream::recv_exact(stream, 1).await?[0];
            encoded.push(byte);
            result |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }

        ctx.register_enc(encoded);
        Ok(result)
    }
}

/// `ZigZag`: signed `VarInt`, mapping `n` to `(n << 1) ^ (n >> (width-1))`.
pub fn zigzag() -> PacketRef<i64> {
    Rc::new(Adapter::new(
        VarInt::new(),
        |n: i64, _ctx: &Context| -> Result<u64> {
            let zz = ((n << 1) ^ (n >> 63)) as u64;
            Ok(zz)
        },
        |zz: u64, _ctx: &Context| -> Result<i64> {
            Ok(((zz >> 1) as i64) ^ -((zz & 1) as i64))
        },
    ))
}

/// Implemented by float types with fixed-width IEEE-754 byte
/// representations, analogous to [`IntCodec`].
pub trait FloatCodec: Sized + Copy {
    const SIZE: usize;

    fn from_bytes(buf: &[u8], endian: Endian) -> Self;
    fn to_bytes(self, endian: Endian) -> Vec<u8>;
}

impl FloatCodec for f32 {
    const SIZE: usize = 4;

    fn from_bytes(buf: &[u8], endian: Endian) -> Self {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(buf);
        match endian {
            Endian::Little => f32::from_le_bytes(arr),
            Endian::Big => f32::from_be_bytes(arr),
        }
    }

    fn to_bytes(self, endian: Endian) -> Vec<u8> {
        match endian {
            Endian::Little => self.to_le_bytes().to_vec(),
            Endian::Big => self.to_be_bytes().to_vec(),
        }
    }
}

impl FloatCodec for f64 {
    const SIZE: usize = 8;

    fn from_bytes(buf: &[u8], endian: Endian) -> Self {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(buf);
        match endian {
            Endian::Little => f64::from_le_bytes(arr),
            Endian::Big => f64::from_be_bytes(arr),
        }
    }

    fn to_bytes(self, endian: Endian) -> Vec<u8> {
        match endian {
            Endian::Little => self.to_le_bytes().to_vec(),
            Endian::Big => self.to_be_bytes().to_vec(),
        }
    }
}

impl FloatCodec for half::f16 {
    const SIZE: usize = 2;

    fn from_bytes(buf: &[u8], endian: Endian) -> Self {
        let mut arr = [0u8; 2];
        arr.copy_from_slice(buf);
        match endian {
            Endian::Little => half::f16::from_le_bytes(arr),
            Endian::Big => half::f16::from_be_bytes(arr),
        }
    }

    fn to_bytes(self, endian: Endian) -> Vec<u8> {
        match endian {
            Endian::Little => self.to_le_bytes().to_vec(),
            Endian::Big => self.to_be_bytes().to_vec(),
        }
    }
}

impl IntoValue for half::f16 {
    fn into_value(self) -> crate::context::Value {
        crate::context::into_value_any(self)
    }
}
impl crate::context::FromValue for half::f16 {
    fn from_value(v: crate::context::Value) -> Result<Self> {
        crate::context::from_value_any(v)
    }
}
impl IntoValue for f32 {
    fn into_value(self) -> crate::context::Value {
        crate::context::into_value_any(self)
    }
}
impl crate::context::FromValue for f32 {
    fn from_value(v: crate::context::Value) -> Result<Self> {
        crate::context::from_value_any(v)
    }
}
impl IntoValue for f64 {
    fn into_value(self) -> crate::context::Value {
        crate::context::into_value_any(self)
    }
}
impl crate::context::FromValue for f64 {
    fn from_value(v: crate::context::Value) -> Result<Self> {
        crate::context::from_value_any(v)
    }
}

/// A fixed-width IEEE-754 float, network order by default.
pub struct Float<F> {
    endian: Endian,
    _marker: PhantomData<F>,
}

impl<F> Float<F> {
    pub fn new(endian: Endian) -> PacketRef<F>
    where
        F: FloatCodec + Clone + IntoValue + 'static,
    {
        Rc::new(Float {
            endian,
            _marker: PhantomData,
        })
    }
}

#[async_trait(?Send)]
impl<F> Packet<F> for Float<F>
where
    F: FloatCodec + Clone + IntoValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &F, ctx: &Context) -> Result<()> {
        let data = ctx.register_enc(value.to_bytes(self.endian));
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<F> {
        let data = ctx.register_enc(crate::stream::recv_exact(stream, F::SIZE).await?);
        Ok(F::from_bytes(&data, self.endian))
    }

    fn size_impl(&self, _ctx: &Context) -> Result<usize> {
        Ok(F::SIZE)
    }
}

/// IEEE-754 half precision, network order.
pub fn half_float() -> PacketRef<half::f16> {
    Float::new(Endian::NETWORK)
}
/// IEEE-754 single precision, network order.
pub fn single_float() -> PacketRef<f32> {
    Float::new(Endian::NETWORK)
}
/// IEEE-754 double precision, network order.
pub fn double_float() -> PacketRef<f64> {
    Float::new(Endian::NETWORK)
}

/// Exactly `size(ctx)` bytes; a mismatched input length on encode is an
/// error.
pub struct Bytes {
    size: crate::context::CtxParam<usize>,
}

impl Bytes {
    pub fn new(size: impl Into<crate::context::CtxParam<usize>>) -> PacketRef<Vec<u8>> {
        Rc::new(Bytes { size: size.into() })
    }
}

#[async_trait(?Send)]
impl Packet<Vec<u8>> for Bytes {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Vec<u8>, ctx: &Context) -> Result<()> {
        let expected = self.size.eval(ctx)?;
        if value.len() != expected {
            return Err(Error::encode(format!(
                "wrong data length for Bytes: expected {expected}, got {}",
                value.len()
            )));
        }

        let data = ctx.register_enc(value.clone());
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Vec<u8>> {
        let expected = self.size.eval(ctx)?;
        Ok(ctx.register_enc(crate::stream::recv_exact(stream, expected).await?))
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.size.eval(ctx)
    }
}

/// A single byte: `Bytes(1)`.
pub fn byte() -> PacketRef<Vec<u8>> {
    Bytes::new(1usize)
}

/// Reads to end-of-stream on decode; writes all provided bytes on encode.
pub struct GreedyBytes;

impl GreedyBytes {
    pub fn new() -> PacketRef<Vec<u8>> {
        Rc::new(GreedyBytes)
    }
}

#[async_trait(?Send)]
impl Packet<Vec<u8>> for GreedyBytes {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Vec<u8>, ctx: &Context) -> Result<()> {
        let data = ctx.register_enc(value.clone());
        stream.send(&data).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Vec<u8>> {
        Ok(ctx.register_enc(stream.recv(None, true).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn varint_scenarios_from_spec() {
        let p = VarInt::new();
        assert_eq!(p.encode_to_bytes(&0).await.unwrap(), vec![0x00]);
        assert_eq!(p.encode_to_bytes(&300).await.unwrap(), vec![0xac, 0x02]);
        assert_eq!(p.decode_from_bytes(&[0xac, 0x02], true).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn zigzag_matches_spec_scenario() {
        let p = zigzag();
        let bytes = p.encode_to_bytes(&12345678).await.unwrap();
        assert_eq!(bytes, vec![0x9c, 0x85, 0xe3, 0x0b]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), 12345678);
    }

    #[tokio::test]
    async fn zigzag_round_trips_negative() {
        let p = zigzag();
        for n in [-1i64, -2, 0, 1, i32::MIN as i64, i32::MAX as i64] {
            let bytes = p.encode_to_bytes(&n).await.unwrap();
            assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn bytes_four_matches_spec_scenario() {
        let p = Bytes::new(4usize);
        assert_eq!(p.encode_to_bytes(&b"abel".to_vec()).await.unwrap(), b"abel");
        assert_eq!(
            p.decode_from_bytes(b"abel", true).await.unwrap(),
            b"abel".to_vec()
        );
    }

    #[tokio::test]
    async fn bytes_int_matches_spec_scenario() {
        let p = BytesInt::new(12, false, Endian::Big);
        let bytes = p.encode_to_bytes(&123456).await.unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[9..], &[0x01, 0xe2, 0x40]);
        assert_eq!(bytes[..9], [0u8; 9]);
        assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), 123456);
    }

    #[tokio::test]
    async fn fixed_int_round_trips_both_endians() {
        let le = u32l();
        let be = u32b();
        let bytes_le = le.encode_to_bytes(&0x01020304).await.unwrap();
        let bytes_be = be.encode_to_bytes(&0x01020304).await.unwrap();
        assert_eq!(bytes_le, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes_be, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(le.decode_from_bytes(&bytes_le, true).await.unwrap(), 0x01020304);
    }

    #[tokio::test]
    async fn greedy_bytes_reads_to_eof() {
        let p = GreedyBytes::new();
        assert_eq!(p.decode_from_bytes(b"rest", true).await.unwrap(), b"rest".to_vec());
    }
}
