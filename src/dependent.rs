//! Dependent-value helpers (`spec.md` §4.7): fields whose value is computed
//! from context rather than supplied directly.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;

use crate::context::{Context, CtxParam, FromValue, IntoValue, Value};
use crate::error::{Error, Result};
use crate::packet::{Adapter, NoOp, Packet, PacketRef, Validator};
use crate::sequence::{Erase, ErasedPacket};
use crate::stream::Stream;

/// Produces no bytes; stores a context-computed value. Encoding with a
/// conflicting user-supplied value is an error.
pub struct Virtual {
    expr: Rc<dyn Fn(&Context) -> Result<Value>>,
}

impl Virtual {
    pub fn new(expr: impl Fn(&Context) -> Result<Value> + 'static) -> PacketRef<Value> {
        Rc::new(Virtual { expr: Rc::new(expr) })
    }
}

#[async_trait(?Send)]
impl Packet<Value> for Virtual {
    async fn encode_impl(&self, _stream: &mut dyn Stream, value: &Value, ctx: &Context) -> Result<()> {
        let deduced = (self.expr)(ctx)?;
        if *value != Value::Unit && *value != deduced {
            return Err(Error::encode("virtual field given a conflicting value"));
        }
        ctx.register_enc(Vec::new());
        ctx.set_value(deduced);
        Ok(())
    }

    async fn decode_impl(&self, _stream: &mut dyn Stream, ctx: &Context) -> Result<Value> {
        let deduced = (self.expr)(ctx)?;
        ctx.register_enc(Vec::new());
        Ok(deduced)
    }

    fn size_impl(&self, _ctx: &Context) -> Result<usize> {
        Ok(0)
    }
}

/// The general base for [`const_field`]/[`default_field`]/[`deduced_field`]:
/// a byte-level `inner` packet whose logical value is computed by
/// `value_expr`, with encode/decode validation and override behavior
/// controlled by three flags (`spec.md` §4.7).
pub struct AutoPacket {
    inner: Rc<dyn ErasedPacket>,
    value_expr: Rc<dyn Fn(&Context) -> Result<Value>>,
    validate_enc: bool,
    validate_dec: bool,
    override_enc: bool,
    postpone_dec: Cell<bool>,
}

impl AutoPacket {
    pub fn new(
        inner: Rc<dyn ErasedPacket>,
        value_expr: impl Fn(&Context) -> Result<Value> + 'static,
        validate_enc: bool,
        validate_dec: bool,
        override_enc: bool,
    ) -> PacketRef<Value> {
        Rc::new(AutoPacket {
            inner,
            value_expr: Rc::new(value_expr),
            validate_enc,
            validate_dec,
            override_enc,
            postpone_dec: Cell::new(false),
        })
    }

    fn schedule_validation(&self, ctx: &Context, decoded: Value) -> Result<()> {
        let expr = self.value_expr.clone();
        let ctx_for_check = ctx.clone();
        let check = move || -> Result<()> {
            let deduced = (expr)(&ctx_for_check)?;
            if decoded != deduced {
                return Err(Error::decode(
                    "decoded value does not match the deduced value",
                ));
            }
            Ok(())
        };

        if !self.postpone_dec.get() {
            return check();
        }

        let parent = ctx
            .parent()
            .ok_or_else(|| Error::decode("postponed field has no parent to defer its check to"))?;
        crate::sequence::on_finish_of(&parent, check)
    }
}

#[async_trait(?Send)]
impl Packet<Value> for AutoPacket {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Value, ctx: &Context) -> Result<()> {
        let deduced = (self.value_expr)(ctx)?;
        let user_present = *value != Value::Unit;

        if self.validate_enc && user_present && *value != deduced {
            return Err(Error::encode(
                "supplied value conflicts with the deduced value",
            ));
        }

        let to_encode = if self.override_enc && user_present {
            value.clone()
        } else {
            deduced
        };

        self.inner.encode_erased(stream, &to_encode, ctx).await?;
        ctx.set_value(to_encode);
        Ok(())
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Value> {
        let decoded = self.inner.decode_erased(stream, ctx).await?;

        if self.validate_dec {
            self.schedule_validation(ctx, decoded.clone())?;
        }

        Ok(decoded)
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.inner.size_erased(ctx)
    }

    fn notify_postponed(&self, level: usize) {
        self.postpone_dec.set(true);
        self.inner.notify_postponed(level);
    }
}

fn erase<T>(inner: PacketRef<T>) -> Rc<dyn ErasedPacket>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    Erase::new(inner)
}

/// User may supply nothing or exactly the deduced value; decoding verifies.
pub fn const_field<T>(
    inner: PacketRef<T>,
    value_expr: impl Fn(&Context) -> Result<Value> + 'static,
) -> PacketRef<Value>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    AutoPacket::new(erase(inner), value_expr, true, true, false)
}

/// [`const_field`] specialized to a fixed, context-independent value — the
/// common case (magic numbers, version bytes).
pub fn const_value<T>(inner: PacketRef<T>, value: Value) -> PacketRef<Value>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    const_field(inner, move |_ctx: &Context| Ok(value.clone()))
}

/// User may override; otherwise the computed default is used. Never
/// validated either way.
pub fn default_field<T>(
    inner: PacketRef<T>,
    value_expr: impl Fn(&Context) -> Result<Value> + 'static,
) -> PacketRef<Value>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    AutoPacket::new(erase(inner), value_expr, false, false, true)
}

/// User-supplied encode value must match the deduced one; the decoded value
/// is accepted as-is (no recomputation on decode). Typically [`postponed`]
/// since `value_expr` references sibling fields encoded so far.
///
/// [`postponed`]: crate::packet::PacketExt::postponed
pub fn deduced_field<T>(
    inner: PacketRef<T>,
    value_expr: impl Fn(&Context) -> Result<Value> + 'static,
) -> PacketRef<Value>
where
    T: Clone + IntoValue + FromValue + 'static,
{
    AutoPacket::new(erase(inner), value_expr, true, false, false)
}

/// A validator over [`NoOp`] asserting `predicate(ctx)` at encode and
/// decode time; commonly postponed so sibling fields are available.
pub fn check(predicate: impl Fn(&Context) -> Result<bool> + 'static) -> PacketRef<()> {
    Rc::new(Validator::new(Rc::new(NoOp), predicate))
}

/// `Adapter<bool, u8>`: zero is false, any nonzero byte is true.
pub fn flag(inner: PacketRef<u8>) -> PacketRef<bool> {
    Rc::new(Adapter::new(
        inner,
        |b: bool, _ctx: &Context| -> Result<u8> { Ok(if b { 1 } else { 0 }) },
        |v: u8, _ctx: &Context| -> Result<bool> { Ok(v != 0) },
    ))
}

/// Implemented by user enums so [`enum_packet`] can translate them to/from
/// an integer wire representation. Combine with [`crate::value_any_impl`]
/// to make the enum usable as a `Struct` field's logical type.
pub trait EnumCodec: Copy + 'static {
    fn to_repr(self) -> i128;
    fn from_repr(v: i128) -> Result<Self>;
}

/// Maps enum members to/from an integer packet's wire representation.
pub fn enum_packet<E, T>(inner: PacketRef<T>) -> PacketRef<E>
where
    E: EnumCodec + Clone + IntoValue + 'static,
    T: Clone + IntoValue + 'static + Copy + TryFrom<i128> + Into<i128>,
{
    Rc::new(Adapter::new(
        inner,
        |e: E, _ctx: &Context| -> Result<T> {
            T::try_from(e.to_repr())
                .map_err(|_| Error::encode("enum value out of range for its wire representation"))
        },
        |v: T, _ctx: &Context| -> Result<E> { E::from_repr(v.into()) },
    ))
}

/// A user-defined bijective dictionary between a logical type `K` and the
/// inner packet's raw type `V`. Unknown keys are a hard error on encode and
/// decode, unless a `direct` pass-through pair is supplied (`allow_direct`
/// in `spec.md` §4.7) for when an unmapped value should flow straight
/// through the underlying representation.
pub struct Mapping<K, V>
where
    K: Clone + PartialEq + IntoValue + 'static,
    V: Clone + PartialEq + IntoValue + 'static,
{
    inner: PacketRef<V>,
    pairs: Vec<(K, V)>,
    #[allow(clippy::type_complexity)]
    direct: Option<(Rc<dyn Fn(&K) -> Option<V>>, Rc<dyn Fn(&V) -> Option<K>>)>,
}

impl<K, V> Mapping<K, V>
where
    K: Clone + PartialEq + IntoValue + 'static,
    V: Clone + PartialEq + IntoValue + 'static,
{
    pub fn new(inner: PacketRef<V>, pairs: Vec<(K, V)>) -> PacketRef<K> {
        Rc::new(Mapping {
            inner,
            pairs,
            direct: None,
        })
    }

    pub fn with_direct(
        inner: PacketRef<V>,
        pairs: Vec<(K, V)>,
        to_inner: impl Fn(&K) -> Option<V> + 'static,
        to_outer: impl Fn(&V) -> Option<K> + 'static,
    ) -> PacketRef<K> {
        Rc::new(Mapping {
            inner,
            pairs,
            direct: Some((Rc::new(to_inner), Rc::new(to_outer))),
        })
    }
}

#[async_trait(?Send)]
impl<K, V> Packet<K> for Mapping<K, V>
where
    K: Clone + PartialEq + IntoValue + 'static,
    V: Clone + PartialEq + IntoValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &K, ctx: &Context) -> Result<()> {
        let mapped = self
            .pairs
            .iter()
            .find(|(k, _)| k == value)
            .map(|(_, v)| v.clone())
            .or_else(|| self.direct.as_ref().and_then(|(to_inner, _)| to_inner(value)))
            .ok_or_else(|| Error::encode("no mapping for this value"))?;

        self.inner.encode_impl(stream, &mapped, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<K> {
        let raw = self.inner.decode_impl(stream, ctx).await?;

        self.pairs
            .iter()
            .find(|(_, v)| *v == raw)
            .map(|(k, _)| k.clone())
            .or_else(|| self.direct.as_ref().and_then(|(_, to_outer)| to_outer(&raw)))
            .ok_or_else(|| Error::decode("no mapping for this raw value"))
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.inner.size_impl(ctx)
    }
}

/// Evaluates a [`CtxParam`]-style context-dependent usize, the common shape
/// for `value_expr` closures that just read a sibling's length.
pub fn ctx_len(path: crate::context::Path) -> CtxParam<usize> {
    crate::context::ctx_fn(move |ctx: &Context| {
        let bytes = path.encoded(ctx)?.unwrap_or_default();
        Ok(bytes.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::{byte, u8 as fixed_u8};
    use crate::packet::Renamed;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn virtual_field_rejects_conflicting_value() {
        let v = Virtual::new(|_ctx: &Context| Ok(Value::UInt(7)));
        assert!(v.encode_to_bytes(&Value::UInt(3)).await.is_err());
        assert!(v.encode_to_bytes(&Value::UInt(7)).await.is_ok());
        assert!(v.encode_to_bytes(&Value::Unit).await.is_ok());
    }

    #[tokio::test]
    async fn const_field_round_trips_and_validates() {
        let magic = const_value(byte(), Value::Bytes(vec![0x41]));
        let bytes = magic.encode_to_bytes(&Value::Unit).await.unwrap();
        assert_eq!(bytes, vec![0x41]);
        assert!(magic.decode_from_bytes(&bytes, true).await.is_ok());
        assert!(magic.decode_from_bytes(&[0x42], true).await.is_err());
    }

    #[tokio::test]
    async fn default_field_allows_override() {
        let field = default_field(fixed_u8(), |_ctx: &Context| Ok(Value::UInt(9)));
        assert_eq!(
            field.encode_to_bytes(&Value::Unit).await.unwrap(),
            vec![9]
        );
        assert_eq!(
            field.encode_to_bytes(&Value::UInt(2)).await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn flag_maps_zero_and_nonzero() {
        let f = flag(fixed_u8());
        assert_eq!(f.encode_to_bytes(&false).await.unwrap(), vec![0]);
        assert_eq!(f.encode_to_bytes(&true).await.unwrap(), vec![1]);
        assert!(f.decode_from_bytes(&[5], true).await.unwrap());
    }

    #[tokio::test]
    async fn mapping_round_trips_and_rejects_unknown() {
        let m: PacketRef<String> = Mapping::new(
            fixed_u8(),
            vec![("red".to_string(), 1u8), ("blue".to_string(), 2u8)],
        );
        assert_eq!(m.encode_to_bytes(&"red".to_string()).await.unwrap(), vec![1]);
        assert_eq!(
            m.decode_from_bytes(&[2], true).await.unwrap(),
            "blue".to_string()
        );
        assert!(m.encode_to_bytes(&"green".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn check_accepts_true_and_rejects_false() {
        let always = check(|_ctx: &Context| Ok(true));
        assert!(always.encode_to_bytes(&()).await.is_ok());
        assert!(always.decode_from_bytes(&[], true).await.is_ok());

        let never = check(|_ctx: &Context| Ok(false));
        assert!(never.encode_to_bytes(&()).await.is_err());
        assert!(never.decode_from_bytes(&[], true).await.is_err());
    }

    #[tokio::test]
    async fn ctx_len_reads_a_sibling_encoded_length() {
        use crate::context::Path;
        use crate::sequence::Struct;

        let msg = crate::string::c_string();
        let len = deduced_field(fixed_u8(), move |ctx: &Context| -> Result<Value> {
            let n = ctx_len(Path::parse("_/msg")).eval(ctx)?;
            Ok(Value::UInt(n as u128))
        });

        let packet = Struct::builder()
            .field("msg", msg)
            .field_erased(Erase::new(Renamed::named(len, "len")))
            .build();

        let mut input = IndexMap::new();
        input.insert("msg".to_string(), Value::Str("Hi".to_string()));
        input.insert("len".to_string(), Value::Unit);

        let bytes = packet.encode_to_bytes(&input).await.unwrap();
        assert_eq!(bytes, vec![0x48, 0x69, 0x00, 0x03]);
    }

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Flags {
        Read,
        Write,
        Other(i128),
    }

    impl EnumCodec for Flags {
        fn to_repr(self) -> i128 {
            match self {
                Flags::Read => 1,
                Flags::Write => 2,
                Flags::Other(v) => v,
            }
        }

        fn from_repr(v: i128) -> Result<Self> {
            Ok(match v {
                1 => Flags::Read,
                2 => Flags::Write,
                other => Flags::Other(other),
            })
        }
    }

    crate::value_any_impl!(Flags);

    #[tokio::test]
    async fn enum_packet_round_trips_named_members() {
        let p: PacketRef<Flags> = enum_packet(fixed_u8());
        assert_eq!(p.encode_to_bytes(&Flags::Write).await.unwrap(), vec![2]);
        assert_eq!(p.decode_from_bytes(&[1], true).await.unwrap(), Flags::Read);
    }

    #[tokio::test]
    async fn enum_packet_surfaces_raw_repr_for_unnamed_members() {
        let p: PacketRef<Flags> = enum_packet(fixed_u8());
        assert_eq!(
            p.decode_from_bytes(&[5], true).await.unwrap(),
            Flags::Other(5)
        );
        assert_eq!(p.encode_to_bytes(&Flags::Other(9)).await.unwrap(), vec![9]);
    }
}
