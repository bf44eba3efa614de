//! The context tree threaded through every encode/decode call
//! (`spec.md` §3–4.1): a per-field scratch node carrying the field's value,
//! its contributed byte slice, named children, and metadata, plus the
//! `Path`/`CtxParam` machinery used to resolve cross-field dependencies.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// The special child name that always resolves to the context itself.
pub const SELF_KEY: &str = "";
/// The special child name that resolves upward to the parent.
pub const PARENT_KEY: &str = "_";

/// The dynamic value carried by a [`Context`] and by `Struct`/`Sequence`
/// fields. Primitive packets produce the scalar variants directly;
/// `Struct` fields produce `Record`; `Array`/`Sequence` without names
/// produce `List`; adapters that build a strongly-typed Rust value (an
/// `Enum`, a user struct produced by `Mapping`) stash it behind `Any`.
#[derive(Clone)]
pub enum Value {
    /// The unit/no value, produced by `NoOp`, `Virtual`'s byte contribution,
    /// padding, and the like.
    Unit,
    Bool(bool),
    Int(i128),
    UInt(u128),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Record(IndexMap<String, Value>),
    /// An escape hatch for strongly-typed leaf values that don't fit the
    /// scalar variants above (e.g. a user enum produced by
    /// [`crate::dependent::Enum`]).
    Any(Rc<dyn Any>),
}

impl Value {
    /// Human-readable type tag, used in `PacketObjType` error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Any(_) => "any",
        }
    }

    pub fn as_record(&self) -> Result<&IndexMap<String, Value>> {
        match self {
            Value::Record(map) => Ok(map),
            other => Err(Error::PacketObjType {
                expected: "record",
                got: other.type_name(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::PacketObjType {
                expected: "bytes",
                got: other.type_name(),
            }),
        }
    }

    pub fn as_int(&self) -> Result<i128> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => Ok(*v as i128),
            other => Err(Error::PacketObjType {
                expected: "int",
                got: other.type_name(),
            }),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "Unit"),
            Value::Bool(v) => write!(f, "Bool({v:?})"),
            Value::Int(v) => write!(f, "Int({v:?})"),
            Value::UInt(v) => write!(f, "UInt({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({v:?})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::List(v) => write!(f, "List({v:?})"),
            Value::Record(v) => write!(f, "Record({v:?})"),
            Value::Any(_) => write!(f, "Any(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Int(a), Value::UInt(b)) | (Value::UInt(b), Value::Int(a)) => {
                *a >= 0 && *a as u128 == *b
            }
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Unit => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i128(*v),
            Value::UInt(v) => serializer.serialize_u128(*v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::Str(v) => serializer.serialize_str(v),
            Value::List(v) => v.serialize(serializer),
            Value::Record(v) => v.serialize(serializer),
            Value::Any(_) => Err(serde::ser::Error::custom(
                "Value::Any holds a runtime-only type and cannot be serialized",
            )),
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a unit, bool, integer, bytes, string, sequence, or map")
            }

            fn visit_unit<E>(self) -> std::result::Result<Value, E> {
                Ok(Value::Unit)
            }

            fn visit_bool<E>(self, v: bool) -> std::result::Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Value, E> {
                Ok(Value::Int(v as i128))
            }

            fn visit_i128<E>(self, v: i128) -> std::result::Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Value, E> {
                Ok(Value::UInt(v as u128))
            }

            fn visit_u128<E>(self, v: u128) -> std::result::Result<Value, E> {
                Ok(Value::UInt(v))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Value, E> {
                Ok(Value::Str(v.to_string()))
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Value, E> {
                Ok(Value::Str(v))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::List(items))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut record = IndexMap::new();
                while let Some((k, v)) = map.next_entry()? {
                    record.insert(k, v);
                }
                Ok(Value::Record(record))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

macro_rules! impl_value_conv_int {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as _)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(v: Value) -> Result<Self> {
                    v.as_int().and_then(|i| {
                        <$ty>::try_from(i).map_err(|_| Error::encode("integer out of range"))
                    })
                }
            }
        )*
    };
}

impl_value_conv_int!(
    i8 => Int, i16 => Int, i32 => Int, i64 => Int, i128 => Int,
    u8 => UInt, u16 => UInt, u32 => UInt, u64 => UInt, u128 => UInt,
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl TryFrom<Value> for bool {
    type Error = Error;
    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bool(b) => Ok(b),
            other => Err(Error::PacketObjType {
                expected: "bool",
                got: other.type_name(),
            }),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl TryFrom<Value> for Vec<u8> {
    type Error = Error;
    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::PacketObjType {
                expected: "bytes",
                got: other.type_name(),
            }),
        }
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl TryFrom<Value> for String {
    type Error = Error;
    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Str(s) => Ok(s),
            other => Err(Error::PacketObjType {
                expected: "str",
                got: other.type_name(),
            }),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}
impl TryFrom<Value> for () {
    type Error = Error;
    fn try_from(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Record(v)
    }
}
impl TryFrom<Value> for IndexMap<String, Value> {
    type Error = Error;
    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Record(m) => Ok(m),
            other => Err(Error::PacketObjType {
                expected: "record",
                got: other.type_name(),
            }),
        }
    }
}

/// Converts an owned logical value into the dynamic [`Value`] representation
/// used by `Struct`/`Sequence` fields. Kept separate from `std::convert::Into`
/// so that `Value`'s own identity conversion doesn't collide with the
/// standard library's blanket `TryFrom` impl.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// The inverse of [`IntoValue`].
pub trait FromValue: Sized {
    fn from_value(v: Value) -> Result<Self>;
}

macro_rules! impl_value_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::from(self)
                }
            }

            impl FromValue for $ty {
                fn from_value(v: Value) -> Result<Self> {
                    <$ty>::try_from(v)
                }
            }
        )*
    };
}

impl_value_scalar!(
    bool, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, Vec<u8>, String, (),
);

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}
impl FromValue for Value {
    fn from_value(v: Value) -> Result<Self> {
        Ok(v)
    }
}

impl IntoValue for IndexMap<String, Value> {
    fn into_value(self) -> Value {
        Value::Record(self)
    }
}
impl FromValue for IndexMap<String, Value> {
    fn from_value(v: Value) -> Result<Self> {
        v.as_record().cloned()
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}
impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(v: Value) -> Result<Self> {
        match v {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(Error::PacketObjType {
                expected: "list",
                got: other.type_name(),
            }),
        }
    }
}

/// Wraps an arbitrary `Clone + 'static` value behind [`Value::Any`], for
/// leaf packets (`Enum`, `Mapping`) whose logical type doesn't have a
/// natural scalar `Value` representation. Use via [`value_any_impl`].
pub fn into_value_any<T: Clone + 'static>(v: T) -> Value {
    Value::Any(Rc::new(v))
}

/// The inverse of [`into_value_any`].
pub fn from_value_any<T: Clone + 'static>(v: Value) -> Result<T> {
    match v {
        Value::Any(rc) => rc
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::decode("Any value had an unexpected underlying type")),
        other => Err(Error::PacketObjType {
            expected: "any",
            got: other.type_name(),
        }),
    }
}

/// Implements [`IntoValue`]/[`FromValue`] for a `Clone + 'static` type via
/// the [`Value::Any`] escape hatch. Use for enums/user types embedded in a
/// `Struct` that have no natural scalar representation.
#[macro_export]
macro_rules! value_any_impl {
    ($ty:ty) => {
        impl $crate::context::IntoValue for $ty {
            fn into_value(self) -> $crate::context::Value {
                $crate::context::into_value_any(self)
            }
        }

        impl $crate::context::FromValue for $ty {
            fn from_value(v: $crate::context::Value) -> $crate::error::Result<Self> {
                $crate::context::from_value_any(v)
            }
        }
    };
}

/// Either a concrete value or a function evaluated lazily against the
/// current context. Mirrors `anf`'s `CtxParam`.
#[derive(Clone)]
pub enum CtxParam<T> {
    Fixed(T),
    Dynamic(Rc<dyn Fn(&Context) -> Result<T>>),
}

impl<T: Clone + 'static> CtxParam<T> {
    /// Evaluates the parameter against `ctx`.
    pub fn eval(&self, ctx: &Context) -> Result<T> {
        match self {
            CtxParam::Fixed(v) => Ok(v.clone()),
            CtxParam::Dynamic(f) => f(ctx),
        }
    }
}

impl<T> From<T> for CtxParam<T>
where
    T: Clone + 'static,
{
    fn from(v: T) -> Self {
        CtxParam::Fixed(v)
    }
}

impl<T> fmt::Debug for CtxParam<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtxParam::Fixed(v) => write!(f, "CtxParam::Fixed({v:?})"),
            CtxParam::Dynamic(_) => write!(f, "CtxParam::Dynamic(..)"),
        }
    }
}

/// Builds a [`CtxParam`] from a closure, the `Dynamic` counterpart to
/// `CtxParam::from`/`.into()` for fixed values.
pub fn ctx_fn<T, F>(f: F) -> CtxParam<T>
where
    F: Fn(&Context) -> Result<T> + 'static,
{
    CtxParam::Dynamic(Rc::new(f))
}

/// A zero-argument callback list fired by the owning `Sequence` once its
/// walk completes; used to run deferred validations and postponed decode
/// checks.
#[derive(Default)]
pub struct Event {
    callbacks: Vec<Box<dyn FnOnce() -> Result<()>>>,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    /// Subscribes `f` to run when the event fires.
    pub fn add(&mut self, f: impl FnOnce() -> Result<()> + 'static) {
        self.callbacks.push(Box::new(f));
    }

    /// Runs every subscriber in subscription order, short-circuiting (and
    /// propagating) on the first error, attributing failures to the
    /// validating field that registered the callback.
    pub fn fire(&mut self) -> Result<()> {
        for cb in self.callbacks.drain(..) {
            cb()?;
        }
        Ok(())
    }
}

/// Scratch metadata a structural combinator stashes on a [`Context`] during
/// its own walk. Closed set of uses, unlike Python's free-form dict, since
/// Rust metadata consumers are known statically.
pub enum MetaValue {
    OnFinish(Event),
    EncPartial(Vec<Option<Vec<u8>>>),
    ExpectedLen(usize),
    Cond(bool),
    Usize(usize),
}

struct ContextInner {
    parent: Option<Context>,
    cur_name: Option<String>,
    value: Option<Value>,
    encoded: Option<Vec<u8>>,
    members: IndexMap<String, Context>,
    metadata: std::collections::HashMap<String, MetaValue>,
}

/// A node in the context tree rooted at each top-level encode/decode call.
/// Cheaply cloneable (an `Rc` handle); `Context` trees are strictly owned by
/// one top-level call and discarded afterward (`spec.md` §3).
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<ContextInner>>,
}

impl Context {
    /// Creates a fresh root context.
    pub fn root() -> Self {
        Context {
            inner: Rc::new(RefCell::new(ContextInner {
                parent: None,
                cur_name: None,
                value: None,
                encoded: None,
                members: IndexMap::new(),
                metadata: std::collections::HashMap::new(),
            })),
        }
    }

    /// Creates (and registers, if `name` is given) a child context for a
    /// field about to be encoded/decoded.
    pub fn make_child(&self, name: Option<&str>) -> Context {
        let child = Context {
            inner: Rc::new(RefCell::new(ContextInner {
                parent: Some(self.clone()),
                cur_name: name.map(String::from),
                value: None,
                encoded: None,
                members: IndexMap::new(),
                metadata: std::collections::HashMap::new(),
            })),
        };

        if let Some(name) = name {
            self.inner
                .borrow_mut()
                .members
                .insert(name.to_string(), child.clone());
        }

        child
    }

    /// The parent context, if any.
    pub fn parent(&self) -> Option<Context> {
        self.inner.borrow().parent.clone()
    }

    /// Stores `value` on this context (called by `Packet::encode`/`decode`
    /// wrappers).
    pub fn set_value(&self, value: Value) {
        self.inner.borrow_mut().value = Some(value);
    }

    /// The value set by `set_value`, if any.
    pub fn value(&self) -> Option<Value> {
        self.inner.borrow().value.clone()
    }

    /// Records `data` as the exact byte slice this context's field
    /// contributed to the stream, and returns it back for convenient
    /// chaining (`ctx.register_enc(bytes)`).
    pub fn register_enc(&self, data: Vec<u8>) -> Vec<u8> {
        self.inner.borrow_mut().encoded = Some(data.clone());
        data
    }

    /// The byte slice registered by `register_enc`, if any.
    pub fn encoded(&self) -> Option<Vec<u8>> {
        self.inner.borrow().encoded.clone()
    }

    /// Looks up a named child by walking one path segment. `""` resolves to
    /// `self`, `"_"` resolves to the parent (erroring if there is none).
    pub fn get_member(&self, name: &str) -> Result<Context> {
        if name == SELF_KEY {
            return Ok(self.clone());
        }
        if name == PARENT_KEY {
            return self
                .parent()
                .ok_or_else(|| Error::decode("context has no parent"));
        }

        self.inner
            .borrow()
            .members
            .get(name)
            .cloned()
            .ok_or_else(|| Error::decode(format!("no such context member: {name}")))
    }

    /// Sets a metadata scratch slot.
    pub fn set_md(&self, key: &str, value: MetaValue) {
        self.inner.borrow_mut().metadata.insert(key.to_string(), value);
    }

    /// Removes and returns a metadata scratch slot.
    pub fn take_md(&self, key: &str) -> Option<MetaValue> {
        self.inner.borrow_mut().metadata.remove(key)
    }

    /// Runs `f` with mutable access to a metadata scratch slot, without
    /// removing it.
    pub fn with_md_mut<R>(&self, key: &str, f: impl FnOnce(&mut MetaValue) -> R) -> Option<R> {
        self.inner.borrow_mut().metadata.get_mut(key).map(f)
    }
}

/// An immutable dotted reference to a context reachable by walking
/// `parent`/`members` links.
#[derive(Clone, Debug)]
pub struct Path {
    segments: Vec<String>,
    or_none: bool,
}

impl Path {
    /// The path referring to the current context (`this`).
    pub fn this() -> Self {
        Path {
            segments: Vec::new(),
            or_none: false,
        }
    }

    /// Parses a `/`-separated dotted path.
    pub fn parse(path: &str) -> Self {
        Path {
            segments: path.split('/').map(String::from).collect(),
            or_none: false,
        }
    }

    /// Descends one more segment.
    pub fn child(mut self, name: impl Into<String>) -> Self {
        self.segments.push(name.into());
        self
    }

    /// Marks the path as tolerant of a not-yet-populated target: evaluating
    /// it then yields `Ok(None)` instead of an error.
    pub fn or_none(mut self) -> Self {
        self.or_none = true;
        self
    }

    /// Walks the path starting at `ctx`.
    pub fn resolve(&self, ctx: &Context) -> Result<Context> {
        let mut cur = ctx.clone();
        for seg in &self.segments {
            cur = cur.get_member(seg)?;
        }
        Ok(cur)
    }

    /// Resolves the path and reads its value.
    pub fn value(&self, ctx: &Context) -> Result<Option<Value>> {
        match self.resolve(ctx) {
            Ok(target) => Ok(target.value()),
            Err(e) if self.or_none => {
                let _ = e;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the path and reads its encoded byte slice.
    pub fn encoded(&self, ctx: &Context) -> Result<Option<Vec<u8>>> {
        match self.resolve(ctx) {
            Ok(target) => Ok(target.encoded()),
            Err(e) if self.or_none => {
                let _ = e;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn child_registers_and_resolves_by_name() {
        let root = Context::root();
        let child = root.make_child(Some("id"));
        child.set_value(Value::UInt(7));
        child.register_enc(vec![0x07]);

        let found = root.get_member("id").unwrap();
        assert_eq!(found.value(), Some(Value::UInt(7)));
        assert_eq!(found.encoded(), Some(vec![0x07]));
    }

    #[test]
    fn underscore_resolves_to_parent() {
        let root = Context::root();
        let child = root.make_child(Some("msg"));
        let resolved = child.get_member(PARENT_KEY).unwrap();
        assert!(Rc::ptr_eq(&resolved.inner, &root.inner));
    }

    #[test]
    fn underscore_without_parent_is_an_error() {
        let root = Context::root();
        assert!(root.get_member(PARENT_KEY).is_err());
    }

    #[test]
    fn path_walks_multiple_segments() {
        let root = Context::root();
        let parent = root.make_child(Some("outer"));
        let child = parent.make_child(Some("inner"));
        child.set_value(Value::Bool(true));

        let path = Path::this().child("outer").child("inner");
        assert_eq!(path.value(&root).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn or_none_suppresses_lookup_errors() {
        let root = Context::root();
        let path = Path::this().child("missing").or_none();
        assert_eq!(path.value(&root).unwrap(), None);
    }

    #[test]
    fn ctx_param_dynamic_evaluates_against_context() {
        let root = Context::root();
        let child = root.make_child(Some("len"));
        child.set_value(Value::UInt(3));

        let param: CtxParam<i128> = ctx_fn(|ctx: &Context| {
            ctx.get_member("len")?.value().unwrap().as_int()
        });

        assert_eq!(param.eval(&root).unwrap(), 3);
    }
}
