//! Conditional combinators (`spec.md` §4.6): packets whose shape is chosen
//! at encode/decode time from context rather than fixed up front.

use std::rc::Rc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::context::{Context, FromValue, IntoValue, MetaValue, Value};
use crate::error::{Error, Result};
use crate::packet::{NoOp, Packet, PacketRef, Renamed};
use crate::sequence::{Erase, ErasedPacket, Struct};
use crate::stream::Stream;

/// Resolves the inner packet from `ctx` at encode, decode, and size time.
/// A lookup failure from `packet_expr` propagates as whatever error it
/// returns (`spec.md` §4.6: "KeyError-like lookup failures map to
/// Encode/Decode/NotSizeable").
pub struct Dynamic<T: Clone + IntoValue + 'static> {
    packet_expr: Rc<dyn Fn(&Context) -> Result<PacketRef<T>>>,
}

impl<T: Clone + IntoValue + 'static> Dynamic<T> {
    pub fn new(packet_expr: impl Fn(&Context) -> Result<PacketRef<T>> + 'static) -> PacketRef<T> {
        Rc::new(Dynamic {
            packet_expr: Rc::new(packet_expr),
        })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<T> for Dynamic<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        let packet = (self.packet_expr)(ctx)?;
        packet.encode_impl(stream, value, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        let packet = (self.packet_expr)(ctx)?;
        packet.decode_impl(stream, ctx).await
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        let packet = (self.packet_expr)(ctx)?;
        packet.size_impl(ctx)
    }
}

const COND_KEY: &str = "cond";

/// Picks between `then_packet` and `else_packet` by `cond_expr(ctx)`,
/// recording the chosen branch as metadata (`spec.md` §4.6).
pub fn conditional<T>(
    cond_expr: impl Fn(&Context) -> Result<bool> + 'static,
    then_packet: PacketRef<T>,
    else_packet: PacketRef<T>,
) -> PacketRef<T>
where
    T: Clone + IntoValue + 'static,
{
    Dynamic::new(move |ctx: &Context| -> Result<PacketRef<T>> {
        let taken = cond_expr(ctx)?;
        ctx.set_md(COND_KEY, MetaValue::Cond(taken));
        Ok(if taken {
            then_packet.clone()
        } else {
            else_packet.clone()
        })
    })
}

/// [`conditional`] with `NoOp` as the `else` branch — the common case of a
/// field that is simply absent when the condition doesn't hold.
pub fn conditional_or_skip(
    cond_expr: impl Fn(&Context) -> Result<bool> + 'static,
    then_packet: PacketRef<()>,
) -> PacketRef<()> {
    conditional(cond_expr, then_packet, Rc::new(NoOp))
}

/// Bridges an [`ErasedPacket`] back into a concrete `Packet<Value>`, the
/// mirror image of [`Erase`].
struct ErasedAsPacket(Rc<dyn ErasedPacket>);

#[async_trait(?Send)]
impl Packet<Value> for ErasedAsPacket {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Value, ctx: &Context) -> Result<()> {
        self.0.encode_erased(stream, value, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Value> {
        self.0.decode_erased(stream, ctx).await
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.0.size_erased(ctx)
    }
}

/// A tagged union: a `tag` field followed by a `value` field whose packet
/// is chosen from `cases` by the decoded/given tag (`spec.md` §4.6). Built
/// as a two-field [`Struct`] (`tag`, `value`); `master_field = "value"`
/// just means callers typically only care about that member once decoded.
pub struct Discriminated;

impl Discriminated {
    pub fn new<Tag>(
        tag_field: PacketRef<Tag>,
        cases: Vec<(Tag, Rc<dyn ErasedPacket>)>,
    ) -> PacketRef<IndexMap<String, Value>>
    where
        Tag: Clone + IntoValue + FromValue + PartialEq + 'static,
    {
        let value_field = Dynamic::new(move |ctx: &Context| -> Result<PacketRef<Value>> {
            let parent = ctx
                .parent()
                .ok_or_else(|| Error::invalid("discriminated value field has no parent"))?;
            let tag_ctx = parent.get_member("tag")?;
            let tag_value = tag_ctx
                .value()
                .ok_or_else(|| Error::invalid("tag not yet available"))?;
            let tag = Tag::from_value(tag_value)?;

            let erased = cases
                .iter()
                .find(|(candidate, _)| *candidate == tag)
                .map(|(_, packet)| packet.clone())
                .ok_or_else(|| Error::invalid("no case registered for this tag"))?;

            Ok(Rc::new(ErasedAsPacket(erased)) as PacketRef<Value>)
        });

        Struct::from_fields(vec![
            Erase::new(Renamed::named(tag_field, "tag")),
            Erase::new(Renamed::named(value_field, "value")),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::u8 as fixed_u8;
    use crate::string::PaddedString;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn dynamic_resolves_inner_packet_from_context() {
        let flag = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag_for_expr = flag.clone();
        let p: PacketRef<Vec<u8>> = Dynamic::new(move |_ctx: &Context| {
            Ok(if flag_for_expr.get() {
                crate::integral::byte()
            } else {
                crate::integral::Bytes::new(2usize)
            })
        });

        flag.set(true);
        let bytes = p.encode_to_bytes(&vec![9]).await.unwrap();
        assert_eq!(bytes, vec![9]);
    }

    #[tokio::test]
    async fn discriminated_matches_spec_scenario() {
        let p = Discriminated::new(
            fixed_u8(),
            vec![
                (0u8, Erase::new(fixed_u8())),
                (1u8, Erase::new(PaddedString::new(8usize))),
            ],
        );

        let mut input = IndexMap::new();
        input.insert("tag".to_string(), Value::UInt(1));
        input.insert("value".to_string(), Value::Str("Hi!!!".to_string()));

        let bytes = p.encode_to_bytes(&input).await.unwrap();
        assert_eq!(
            bytes,
            vec![0x01, b'H', b'i', b'!', b'!', b'!', 0x00, 0x00, 0x00]
        );

        let decoded = p.decode_from_bytes(&bytes, true).await.unwrap();
        assert_eq!(decoded.get("tag"), Some(&Value::UInt(1)));
        assert_eq!(decoded.get("value"), Some(&Value::Str("Hi!!!".to_string())));
    }
}
