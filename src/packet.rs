//! The packet interface (`spec.md` §4.1): the `encode`/`decode`/`size`
//! contract every combinator implements, and the four wrappers
//! (`Adapter`, `Validator`, `Renamed`, `PacketWrapper`) combinators are
//! built from.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;

use crate::context::{Context, IntoValue, Value};
use crate::error::{Error, Result};
use crate::stream::{InMemoryStream, Stream};

/// A reference-counted, freely shareable packet description.
pub type PacketRef<T> = Rc<dyn Packet<T>>;

/// The base interface for a packet description with logical value type `T`.
///
/// `T: IntoValue` so that every field's value can be deposited on its
/// [`Context`] in the uniform dynamic representation that path-based
/// cross-field lookups (`Deduced`, `Virtual`, `Checksum`, ...) rely on.
///
/// Packets are immutable after construction and freely shareable
/// (`spec.md` §3); the only state that changes over a packet's lifetime is
/// the postpone-level/validation-deferral flag flipped once, at
/// construction time, by [`Packet::postponed`] — never concurrently, and
/// never after the packet has been shared.
#[async_trait(?Send)]
pub trait Packet<T>
where
    T: Clone + IntoValue + 'static,
{
    /// Encodes `value` to `stream`. Implementors should prefer
    /// [`Context::register_enc`] to record the bytes they contribute.
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()>;

    /// Decodes a value of type `T` from `stream`.
    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T>;

    /// Returns the packet's size in `ctx`, or a `NotSizeable` error.
    ///
    /// The default falls back to whatever was already encoded on `ctx`
    /// (mirroring `anf.IPacket._sizeof`'s default).
    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        ctx.encoded()
            .map(|b| b.len())
            .ok_or_else(|| Error::not_sizeable("packet wasn't yet encoded"))
    }

    /// This packet's name, if any. [`Renamed`] is the only wrapper that
    /// grants one.
    fn name(&self) -> Option<String> {
        None
    }

    /// Non-negative ordering used to defer this field's *encoding* after
    /// lower-level siblings within the enclosing `Sequence` (`spec.md`
    /// §4.2). Does not affect decode order.
    fn postpone_level(&self) -> usize {
        0
    }

    /// Notifies the packet that it has been postponed to `level`, so
    /// wrappers like [`Validator`] can switch their decode-time check to run
    /// on the enclosing `Sequence`'s `on_finish` instead of immediately.
    fn notify_postponed(&self, _level: usize) {}

    /// Encodes `value`, creating a fresh root context if `ctx` is `None`,
    /// and deposits `value` on it before delegating.
    async fn encode(
        &self,
        stream: &mut dyn Stream,
        value: &T,
        ctx: Option<Context>,
    ) -> Result<()> {
        let ctx = ctx.unwrap_or_else(Context::root);
        ctx.set_value(value.clone().into_value());
        self.encode_impl(stream, value, &ctx).await
    }

    /// Decodes a value, creating a fresh root context if `ctx` is `None`,
    /// and deposits the result on it before returning.
    async fn decode(&self, stream: &mut dyn Stream, ctx: Option<Context>) -> Result<T> {
        let ctx = ctx.unwrap_or_else(Context::root);
        let value = self.decode_impl(stream, &ctx).await?;
        ctx.set_value(value.clone().into_value());
        Ok(value)
    }

    /// Returns the packet's size, creating a fresh root context if `ctx` is
    /// `None`.
    fn size(&self, ctx: Option<&Context>) -> Result<usize> {
        match ctx {
            Some(ctx) => self.size_impl(ctx),
            None => self.size_impl(&Context::root()),
        }
    }

    /// Encodes `value` to an in-memory stream and returns the resulting
    /// bytes.
    async fn encode_to_bytes(&self, value: &T) -> Result<Vec<u8>> {
        let mut stream = InMemoryStream::new();
        self.encode(&mut stream, value, None).await?;
        Ok(stream.get_data())
    }

    /// Decodes a value from `data`. When `completely` is set (the default
    /// per `spec.md` §4.1), unread trailing bytes are a decode error.
    async fn decode_from_bytes(&self, data: &[u8], completely: bool) -> Result<T> {
        let mut stream = InMemoryStream::with_data(data.to_vec());
        let value = self.decode(&mut stream, None).await?;

        if completely && !stream.at_eof() {
            return Err(Error::decode("unexpected trailing bytes remaining"));
        }

        Ok(value)
    }
}

/// A forwarding base carrying the wrapped inner packet, the root every other
/// wrapper in this module is built from.
pub struct PacketWrapper<T: Clone + IntoValue + 'static> {
    pub(crate) wrapped: PacketRef<T>,
}

impl<T: Clone + IntoValue + 'static> PacketWrapper<T> {
    pub fn new(wrapped: PacketRef<T>) -> Self {
        PacketWrapper { wrapped }
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<T> for PacketWrapper<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        self.wrapped.encode_impl(stream, value, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        self.wrapped.decode_impl(stream, ctx).await
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.wrapped.size_impl(ctx)
    }

    fn name(&self) -> Option<String> {
        self.wrapped.name()
    }

    fn postpone_level(&self) -> usize {
        self.wrapped.postpone_level()
    }

    fn notify_postponed(&self, level: usize) {
        self.wrapped.notify_postponed(level)
    }
}

/// Encode transforms `T -> U`, decode transforms `U -> T`; the inner packet
/// only ever sees `U`.
pub struct Adapter<T, U>
where
    T: Clone + IntoValue + 'static,
    U: Clone + IntoValue + 'static,
{
    inner: PacketRef<U>,
    to: Rc<dyn Fn(T, &Context) -> Result<U>>,
    from: Rc<dyn Fn(U, &Context) -> Result<T>>,
}

impl<T, U> Adapter<T, U>
where
    T: Clone + IntoValue + 'static,
    U: Clone + IntoValue + 'static,
{
    pub fn new(
        inner: PacketRef<U>,
        to: impl Fn(T, &Context) -> Result<U> + 'static,
        from: impl Fn(U, &Context) -> Result<T> + 'static,
    ) -> Self {
        Adapter {
            inner,
            to: Rc::new(to),
            from: Rc::new(from),
        }
    }
}

#[async_trait(?Send)]
impl<T, U> Packet<T> for Adapter<T, U>
where
    T: Clone + IntoValue + 'static,
    U: Clone + IntoValue + 'static,
{
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        let transformed = (self.to)(value.clone(), ctx)?;
        self.inner.encode_impl(stream, &transformed, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        let inner_value = self.inner.decode_impl(stream, ctx).await?;
        (self.from)(inner_value, ctx)
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
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

/// Applies `predicate(ctx)` either immediately or, once
/// [`Packet::notify_postponed`] has been called, deferred onto the
/// enclosing `Sequence`'s `on_finish` event.
pub struct Validator<T: Clone + IntoValue + 'static> {
    wrapped: PacketRef<T>,
    predicate: Rc<dyn Fn(&Context) -> Result<bool>>,
    postpone_validation: Cell<bool>,
}

impl<T: Clone + IntoValue + 'static> Validator<T> {
    pub fn new(wrapped: PacketRef<T>, predicate: impl Fn(&Context) -> Result<bool> + 'static) -> Self {
        Validator {
            wrapped,
            predicate: Rc::new(predicate),
            postpone_validation: Cell::new(false),
        }
    }

    fn validate(&self, ctx: &Context) -> Result<()> {
        if !(self.predicate)(ctx)? {
            return Err(Error::invalid("validation failed"));
        }
        Ok(())
    }

    fn schedule_validation(&self, ctx: &Context) -> Result<()> {
        if !self.postpone_validation.get() {
            return self.validate(ctx);
        }

        let parent = ctx
            .parent()
            .ok_or_else(|| Error::invalid("postponed validator has no parent to defer to"))?;
        let predicate = self.predicate.clone();
        let ctx = ctx.clone();

        crate::sequence::on_finish_of(&parent, move || {
            if !(predicate)(&ctx)? {
                return Err(Error::invalid("validation failed"));
            }
            Ok(())
        })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<T> for Validator<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        self.wrapped.encode_impl(stream, value, ctx).await?;
        self.schedule_validation(ctx)
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        let value = self.wrapped.decode_impl(stream, ctx).await?;
        ctx.set_value(value.clone().into_value());
        self.schedule_validation(ctx)?;
        Ok(value)
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.wrapped.size_impl(ctx)
    }

    fn name(&self) -> Option<String> {
        self.wrapped.name()
    }

    fn postpone_level(&self) -> usize {
        self.wrapped.postpone_level()
    }

    fn notify_postponed(&self, level: usize) {
        self.postpone_validation.set(true);
        self.wrapped.notify_postponed(level);
    }
}

/// Sets the name and/or postpone level exposed to the enclosing `Sequence`.
/// Renaming is the only mechanism by which a packet acquires a name.
pub struct Renamed<T: Clone + IntoValue + 'static> {
    wrapped: PacketRef<T>,
    name: Option<String>,
    postpone_level: usize,
}

impl<T: Clone + IntoValue + 'static> Renamed<T> {
    /// Renames `wrapped` to `name`, keeping its existing postpone level.
    pub fn named(wrapped: PacketRef<T>, name: impl Into<String>) -> PacketRef<T> {
        let postpone_level = wrapped.postpone_level();
        Rc::new(Renamed {
            wrapped,
            name: Some(name.into()),
            postpone_level,
        })
    }

    /// Wraps `wrapped` to postpone its encoding to `level` (`level >= 1`),
    /// notifying it so wrappers like [`Validator`] can defer their checks.
    pub fn postponed(wrapped: PacketRef<T>, level: usize) -> PacketRef<T> {
        wrapped.notify_postponed(level);
        let name = wrapped.name();
        Rc::new(Renamed {
            wrapped,
            name,
            postpone_level: level,
        })
    }
}

#[async_trait(?Send)]
impl<T: Clone + IntoValue + 'static> Packet<T> for Renamed<T> {
    async fn encode_impl(&self, stream: &mut dyn Stream, value: &T, ctx: &Context) -> Result<()> {
        self.wrapped.encode_impl(stream, value, ctx).await
    }

    async fn decode_impl(&self, stream: &mut dyn Stream, ctx: &Context) -> Result<T> {
        self.wrapped.decode_impl(stream, ctx).await
    }

    fn size_impl(&self, ctx: &Context) -> Result<usize> {
        self.wrapped.size_impl(ctx)
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn postpone_level(&self) -> usize {
        self.postpone_level
    }

    fn notify_postponed(&self, level: usize) {
        self.wrapped.notify_postponed(level);
    }
}

/// Extension methods available on every `PacketRef<T>`, mirroring
/// `IPacket.renamed`/`.postponed` from the original source.
pub trait PacketExt<T: Clone + IntoValue + 'static>: Packet<T> {
    /// Renames this packet to `name`. The only way a packet acquires a name.
    fn renamed(self: PacketRef<T>, name: impl Into<String>) -> PacketRef<T> {
        Renamed::named(self, name)
    }

    /// Postpones this packet's encoding to `level` (default 1 via
    /// [`Packet::postpone_level`] semantics).
    fn postponed(self: PacketRef<T>, level: usize) -> PacketRef<T> {
        Renamed::postponed(self, level)
    }
}

impl<T: Clone + IntoValue + 'static, P: Packet<T> + ?Sized> PacketExt<T> for P {}

/// A packet that encodes/decodes nothing: zero bytes, unit value.
pub struct NoOp;

#[async_trait(?Send)]
impl Packet<()> for NoOp {
    async fn encode_impl(&self, _stream: &mut dyn Stream, _value: &(), ctx: &Context) -> Result<()> {
        ctx.register_enc(Vec::new());
        Ok(())
    }

    async fn decode_impl(&self, _stream: &mut dyn Stream, ctx: &Context) -> Result<()> {
        ctx.register_enc(Vec::new());
        Ok(())
    }

    fn size_impl(&self, _ctx: &Context) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral::u8_le;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn renamed_exposes_name_and_forwards_behavior() {
        let packet: PacketRef<u8> = u8_le();
        let named = packet.renamed("tag");
        assert_eq!(named.name().as_deref(), Some("tag"));

        let bytes = named.encode_to_bytes(&7).await.unwrap();
        assert_eq!(bytes, vec![7]);
    }

    #[tokio::test]
    async fn adapter_round_trips_through_transform() {
        let inner: PacketRef<u8> = u8_le();
        let adapter: PacketRef<bool> = Rc::new(Adapter::new(
            inner,
            |b: bool, _ctx: &Context| Ok(if b { 1u8 } else { 0u8 }),
            |v: u8, _ctx: &Context| Ok(v != 0),
        ));

        let bytes = adapter.encode_to_bytes(&true).await.unwrap();
        assert_eq!(bytes, vec![1]);
        let decoded = adapter.decode_from_bytes(&bytes, true).await.unwrap();
        assert!(decoded);
    }
}
