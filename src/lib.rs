//! A declarative binary packet framework: composable combinators that
//! symmetrically encode and decode structured values to and from byte
//! streams, with a context tree for cross-field dependencies.

pub mod context;
pub mod error;
pub mod packet;
pub mod stream;

pub mod conditional;
pub mod dependent;
pub mod integral;
pub mod sequence;
pub mod string;
pub mod structural;

pub use context::{Context, CtxParam, Event, FromValue, IntoValue, MetaValue, Path, Value};
pub use error::{Error, Result};
pub use packet::{Adapter, NoOp, Packet, PacketExt, PacketRef, PacketWrapper, Renamed, Validator};
pub use stream::{InMemoryStream, IoStream, Stream, StreamGuard};

pub use conditional::{conditional, conditional_or_skip, Discriminated, Dynamic};
pub use dependent::{
    check, const_field, const_value, ctx_len, default_field, deduced_field, enum_packet, flag, AutoPacket,
    EnumCodec, Mapping, Virtual,
};
pub use integral::{
    byte, double_float, half_float, single_float, var_int, zigzag, Bytes, BytesInt, Endian, FixedInt, Float,
    GreedyBytes, VarInt,
};
pub use sequence::{on_finish_of, Erase, ErasedPacket, Sequence, Struct, StructBuilder};
pub use string::{c_string, greedy_string, CString, Encoding, GreedyString, PaddedString, PascalString, Utf8};
pub use structural::{checksum, count_prefixed_bytes, Aligned, Array, CountPrefixed, Padded, SizePrefixed, Transformed};
