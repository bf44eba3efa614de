//! `Sequence` and `Struct` (`spec.md` §4.2): an ordered field list with
//! two-pass postponed encoding, and the name-erasing adapter view over it.

use std::rc::Rc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::context::{Context, Event, FromValue, IntoValue, MetaValue, Value};
use crate::error::{Error, Result};
use crate::packet::{Adapter, Packet, PacketRef, Renamed};
use crate::stream::{InMemoryStream, Stream};

const ON_FINISH_KEY: &str = "on_finish";
const ENC_PARTIAL_KEY: &str = "enc_partial";

/// Context-attribute names a field name must not shadow
/// (`spec.md` §4.2 "Field-name lookup attributes").
const RESERVED_FIELD_NAMES: &[&str] = &[
    "value",
    "encoded",
    "parent",
    "members",
    "metadata",
    crate::context::PARENT_KEY,
    crate::context::SELF_KEY,
];

/// A type-erased packet operating on the dynamic [`Value`] representation,
/// so heterogeneous fields can live together in one [`Sequence`]. Bridges a
/// concrete `Packet<T>` via [`Erase`].
#[async_trait(?Send)]
pub trait ErasedPacket {
    async fn encode_erased(&self, stream: &mut dyn Stream, value: &Value, ctx: &Context) -> Result<()>;

    async fn decode_erased(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Value>;

    fn size_erased(&self, ctx: &Context) -> Result<usize>;

    fn name(&self) -> Option<String>;

    fn postpone_level(&self) -> usize;

    fn notify_postponed(&self, level: usize);
}

/// Bridges a concrete `Packet<T>` into [`ErasedPacket`]. `T` must also be
/// [`FromValue`] so an incoming `Value` can be converted back before being
/// handed to the wrapped packet.
pub struct Erase<T: Clone + IntoValue + FromValue + 'static> {
    inner: PacketRef<T>,
}

impl<T: Clone + IntoValue + FromValue + 'static> Erase<T> {
    pub fn new(inner: PacketRef<T>) -> Rc<dyn ErasedPacket> {
        Rc::new(Erase { inner })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + FromValue + 'static> ErasedPacket for Erase<T> {
    async fn encode_erased(&self, stream: &mut dyn Stream, value: &Value, ctx: &Context) -> Result<()> {
        let typed = T::from_value(value.clone())?;
        ctx.set_value(typed.clone().into_value());
        self.inner.encode_impl(stream, &typed, ctx).await
    }

    async fn decode_erased(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Value> {
        let typed = self.inner.decode_impl(stream, ctx).await?;
        let value = typed.into_value();
        ctx.set_value(value.clone());
        Ok(value)
    }

    fn size_erased(&self, ctx: &Context) -> Result<usize> {
        self.inner.size_impl(ctx)
    }

    fn name(&self) -> Option<String> {
        self.inner.name()
    }

    fn postpone_level(&self) -> usize {
        self.inner.postpone_level()
    }

    fn notify_postponed(&self, level: usize) {
        self.inner.notify_postponed(level)
    }
}

/// Registers `callback` on the nearest enclosing `Sequence`'s `on_finish`
/// event, for deferred (postponed) validators and `AutoPacket` decode
/// checks.
pub(crate) fn on_finish_of(ctx: &Context, callback: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
    let registered = ctx.with_md_mut(ON_FINISH_KEY, move |md| {
        if let MetaValue::OnFinish(ev) = md {
            ev.add(callback);
            true
        } else {
            false
        }
    });

    match registered {
        Some(true) => Ok(()),
        _ => Err(Error::invalid(
            "no on_finish event on the enclosing sequence",
        )),
    }
}

/// An ordered list of fields (`spec.md` §4.2). Its logical value is a
/// positional list; [`Struct`] is the name-indexed adapter built on top.
pub struct Sequence {
    fields: Vec<Rc<dyn ErasedPacket>>,
}

impl Sequence {
    pub fn new(fields: Vec<Rc<dyn ErasedPacket>>) -> PacketRef<Vec<Value>> {
        Rc::new(Sequence { fields })
    }

    fn store_partial(ctx: &Context, index: usize, bytes: Vec<u8>) {
        ctx.with_md_mut(ENC_PARTIAL_KEY, |md| {
            if let MetaValue::EncPartial(slots) = md {
                slots[index] = Some(bytes);
            }
        });
    }

    fn take_concatenated(ctx: &Context) -> Vec<u8> {
        match ctx.take_md(ENC_PARTIAL_KEY) {
            Some(MetaValue::EncPartial(slots)) => {
                slots.into_iter().flat_map(|s| s.unwrap_or_default()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn fire_on_finish(ctx: &Context) -> Result<()> {
        match ctx.take_md(ON_FINISH_KEY) {
            Some(MetaValue::OnFinish(mut event)) => event.fire(),
            _ => Ok(()),
        }
    }
}

#[async_trait(?Send)]
impl Packet<Vec<Value>> for Sequence {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &Vec<Value>, ctx: &Context) -> Result<()> {
        let n = self.fields.len();
        ctx.set_md(ON_FINISH_KEY, MetaValue::OnFinish(Event::new()));
        ctx.set_md(ENC_PARTIAL_KEY, MetaValue::EncPartial(vec![None; n]));

        let two_pass = self.fields.iter().any(|f| f.postpone_level() > 0);

        if !two_pass {
            for (i, field) in self.fields.iter().enumerate() {
                let child = ctx.make_child(field.name().as_deref());
                let field_value = value.get(i).cloned().unwrap_or(Value::Unit);
                field.encode_erased(stream, &field_value, &child).await?;
                let bytes = child.encoded().unwrap_or_default();
                Self::store_partial(ctx, i, bytes);
            }
        } else {
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&i| self.fields[i].postpone_level());

            for i in order {
                let field = &self.fields[i];
                let child = ctx.make_child(field.name().as_deref());
                let field_value = value.get(i).cloned().unwrap_or(Value::Unit);
                let mut scratch = InMemoryStream::new();
                field.encode_erased(&mut scratch, &field_value, &child).await?;
                let bytes = child.encoded().unwrap_or_else(|| scratch.get_data());
                Self::store_partial(ctx, i, bytes);
            }
        }

        let total = Self::take_concatenated(ctx);

        if two_pass {
            stream.send(&total).await?;
        }

        ctx.register_enc(total);
        Self::fire_on_finish(ctx)
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<Vec<Value>> {
        let n = self.fields.len();
        ctx.set_md(ON_FINISH_KEY, MetaValue::OnFinish(Event::new()));
        ctx.set_md(ENC_PARTIAL_KEY, MetaValue::EncPartial(vec![None; n]));

        let mut values = Vec::with_capacity(n);

        for (i, field) in self.fields.iter().enumerate() {
            let child = ctx.make_child(field.name().as_deref());
            let value = field.decode_erased(stream, &child).await?;
            let bytes = child.encoded().unwrap_or_default();
            Self::store_partial(ctx, i, bytes);
            values.push(value);
        }

        let total = Self::take_concatenated(ctx);
        ctx.register_enc(total);
        Self::fire_on_finish(ctx)?;

        Ok(values)
    }
}

/// The name-indexed adapter view over a [`Sequence`]:
/// `Adapter<Record, List<Value>>` (`spec.md` §4.2).
pub struct Struct;

impl Struct {
    /// Builds a `Struct` directly from already-named, erased fields (the
    /// "positional list of renamed packets" construction form).
    pub fn from_fields(fields: Vec<Rc<dyn ErasedPacket>>) -> PacketRef<IndexMap<String, Value>> {
        for field in &fields {
            if let Some(name) = field.name() {
                if RESERVED_FIELD_NAMES.contains(&name.as_str()) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(field = %name, "field name shadows a context attribute");
                }
            }
        }

        let names: Vec<Option<String>> = fields.iter().map(|f| f.name()).collect();
        let sequence = Sequence::new(fields);

        let names_to = names.clone();
        let names_from = names;

        Rc::new(Adapter::new(
            sequence,
            move |map: IndexMap<String, Value>, _ctx: &Context| -> Result<Vec<Value>> {
                Ok(names_to
                    .iter()
                    .map(|name| match name {
                        Some(n) => map.get(n).cloned().unwrap_or(Value::Unit),
                        None => Value::Unit,
                    })
                    .collect())
            },
            move |list: Vec<Value>, _ctx: &Context| -> Result<IndexMap<String, Value>> {
                let mut out = IndexMap::new();
                for (name, value) in names_from.iter().zip(list.into_iter()) {
                    if let Some(n) = name {
                        out.insert(n.clone(), value);
                    }
                }
                Ok(out)
            },
        ))
    }

    /// Starts the keyword-mapping construction form: `Struct::builder()
    /// .field("id", var_int()).field("msg", c_string()).build()`.
    pub fn builder() -> StructBuilder {
        StructBuilder::new()
    }
}

/// Unifies the three equivalent `Struct` construction forms described in
/// `spec.md` §6.3 behind one API, since Rust has no declarative-class-body
/// feature to mirror the third form directly.
#[derive(Default)]
pub struct StructBuilder {
    fields: Vec<Rc<dyn ErasedPacket>>,
}

impl StructBuilder {
    pub fn new() -> Self {
        StructBuilder { fields: Vec::new() }
    }

    /// Adds a named field, wrapping `packet` in [`Renamed`] (the sole
    /// mechanism by which a packet acquires a name) before erasing it.
    pub fn field<T>(mut self, name: impl Into<String>, packet: PacketRef<T>) -> Self
    where
        T: Clone + IntoValue + FromValue + 'static,
    {
        let named = Renamed::named(packet, name);
        self.fields.push(Erase::new(named));
        self
    }

    /// Adds a field that is already erased (e.g. produced by another
    /// combinator such as [`crate::conditional::Discriminated`]).
    pub fn field_erased(mut self, packet: Rc<dyn ErasedPacket>) -> Self {
        self.fields.push(packet);
        self
    }

    pub fn build(self) -> PacketRef<IndexMap<String, Value>> {
        Struct::from_fields(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::{u8 as fixed_u8, var_int};
    use crate::string::c_string;
    use pretty_assertions::assert_eq;

    fn field_of<T>(name: &str, packet: PacketRef<T>) -> Rc<dyn ErasedPacket>
    where
        T: Clone + IntoValue + FromValue + 'static,
    {
        Erase::new(Renamed::named(packet, name))
    }

    #[tokio::test]
    async fn sequence_round_trips_in_declaration_order() {
        let seq = Sequence::new(vec![
            field_of("a", fixed_u8()),
            field_of("b", fixed_u8()),
        ]);

        let values = vec![Value::UInt(1), Value::UInt(2)];
        let bytes = seq.encode_to_bytes(&values).await.unwrap();
        assert_eq!(bytes, vec![1, 2]);

        let decoded = seq.decode_from_bytes(&bytes, true).await.unwrap();
        assert_eq!(decoded, values);
    }

    #[tokio::test]
    async fn struct_builder_round_trips_named_fields() {
        let packet = Struct::builder()
            .field("id", fixed_u8())
            .field("msg", c_string())
            .build();

        let mut input = IndexMap::new();
        input.insert("id".to_string(), Value::UInt(7));
        input.insert("msg".to_string(), Value::Str("Hi".to_string()));

        let bytes = packet.encode_to_bytes(&input).await.unwrap();
        assert_eq!(bytes, vec![7, b'H', b'i', 0]);

        let decoded = packet.decode_from_bytes(&bytes, true).await.unwrap();
        assert_eq!(decoded.get("id"), Some(&Value::UInt(7)));
        assert_eq!(decoded.get("msg"), Some(&Value::Str("Hi".to_string())));
    }

    #[tokio::test]
    async fn postponed_field_still_appears_at_declared_position() {
        let len_field = Renamed::postponed(var_int(), 1);
        let body_field = fixed_u8();

        let packet = Struct::from_fields(vec![
            field_of("len", len_field),
            Erase::new(Renamed::named(body_field, "body")),
        ]);

        let mut input = IndexMap::new();
        input.insert("len".to_string(), Value::UInt(99)); // ignored by a real Deduced; here VarInt just encodes it
        input.insert("body".to_string(), Value::UInt(5));

        let bytes = packet.encode_to_bytes(&input).await.unwrap();
        // len (1 byte varint) then body (1 byte) - postponement doesn't change
        // position, only evaluation order.
        assert_eq!(bytes.len(), 2);
        assert_eq!(bytes[1], 5);
    }
}
