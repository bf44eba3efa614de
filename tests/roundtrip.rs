//! End-to-end byte-level scenarios exercising the full combinator stack
//! together, rather than one module at a time.

use anf::context::{Context, Value};
use anf::integral::{byte, var_int, zigzag, Bytes, BytesInt, Endian};
use anf::packet::{Packet, Renamed};
use anf::sequence::{Erase, Struct};
use anf::string::{c_string, PaddedString};
use anf::structural::{checksum, count_prefixed_bytes, SizePrefixed};
use anf::{conditional::Discriminated, dependent::const_value, integral::u8 as fixed_u8};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn scenario_1_varint_and_zigzag() {
    let v = var_int();
    assert_eq!(v.encode_to_bytes(&0).await.unwrap(), vec![0x00]);
    assert_eq!(v.encode_to_bytes(&300).await.unwrap(), vec![0xac, 0x02]);
    assert_eq!(v.decode_from_bytes(&[0xac, 0x02], true).await.unwrap(), 300);

    let z = zigzag();
    assert_eq!(
        z.encode_to_bytes(&12345678).await.unwrap(),
        vec![0x9c, 0x85, 0xe3, 0x0b]
    );
    assert_eq!(
        z.decode_from_bytes(&[0x9c, 0x85, 0xe3, 0x0b], true).await.unwrap(),
        12345678
    );
}

#[tokio::test]
async fn scenario_2_fixed_bytes() {
    let p = Bytes::new(4usize);
    let bytes = p.encode_to_bytes(&b"abel".to_vec()).await.unwrap();
    assert_eq!(bytes, vec![0x61, 0x62, 0x65, 0x6c]);
    assert_eq!(
        p.decode_from_bytes(&[0x61, 0x62, 0x65, 0x6c], true).await.unwrap(),
        b"abel".to_vec()
    );
}

#[tokio::test]
async fn scenario_3_bytes_int() {
    let p = BytesInt::new(12, false, Endian::Big);
    let bytes = p.encode_to_bytes(&123456).await.unwrap();
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[..9], &[0u8; 9]);
    assert_eq!(&bytes[9..], &[0x01, 0xe2, 0x40]);
    assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), 123456);
}

#[tokio::test]
async fn scenario_4_count_prefixed_bytes() {
    let p = count_prefixed_bytes(var_int());
    let body = b"Abel is the best!".to_vec();
    let bytes = p.encode_to_bytes(&body).await.unwrap();
    assert_eq!(bytes[0], 0x11);
    assert_eq!(&bytes[1..], body.as_slice());
    assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), body);
}

#[tokio::test]
async fn scenario_5_struct_with_checksum() {
    let magic = const_value(Bytes::new(4usize), Value::Bytes(b"ABEL".to_vec()));
    let csum = checksum(
        fixed_u8(),
        |ctx: &Context| {
            let parent = ctx.parent().expect("checksum field has a parent");
            let msg_ctx = parent.get_member("msg")?;
            msg_ctx
                .encoded()
                .ok_or_else(|| anf::error::Error::PacketInvalid("msg not yet encoded".to_string()))
        },
        |data: &[u8]| data.iter().map(|&b| b as u64).sum(),
        |sum: u64| Value::UInt((sum % 256) as u128),
    );

    let packet = Struct::builder()
        .field_erased(Erase::new(Renamed::named(magic, "magic")))
        .field("id", var_int())
        .field("msg", c_string())
        .field_erased(Erase::new(Renamed::named(csum, "csum")))
        .build();

    let mut input = IndexMap::new();
    input.insert("magic".to_string(), Value::Bytes(b"ABEL".to_vec()));
    input.insert("id".to_string(), Value::UInt(123));
    input.insert("msg".to_string(), Value::Str("Hi".to_string()));
    input.insert("csum".to_string(), Value::Unit);

    let bytes = packet.encode_to_bytes(&input).await.unwrap();
    assert_eq!(
        bytes,
        vec![0x41, 0x42, 0x45, 0x4c, 0x7b, 0x48, 0x69, 0x00, 0xb1]
    );

    let decoded = packet.decode_from_bytes(&bytes, true).await.unwrap();
    assert_eq!(decoded.get("id"), Some(&Value::UInt(123)));
    assert_eq!(decoded.get("msg"), Some(&Value::Str("Hi".to_string())));
    assert_eq!(decoded.get("csum"), Some(&Value::UInt(0xb1)));
}

#[tokio::test]
async fn scenario_6_discriminated_union() {
    let packet = Discriminated::new(
        fixed_u8(),
        vec![
            (0u8, Erase::new(fixed_u8())),
            (1u8, Erase::new(PaddedString::new(8usize))),
        ],
    );

    let mut input = IndexMap::new();
    input.insert("tag".to_string(), Value::UInt(1));
    input.insert("value".to_string(), Value::Str("Hi!!!".to_string()));

    let bytes = packet.encode_to_bytes(&input).await.unwrap();
    assert_eq!(
        bytes,
        vec![0x01, 0x48, 0x69, 0x21, 0x21, 0x21, 0x00, 0x00, 0x00]
    );

    let decoded = packet.decode_from_bytes(&bytes, true).await.unwrap();
    assert_eq!(decoded.get("tag"), Some(&Value::UInt(1)));
    assert_eq!(decoded.get("value"), Some(&Value::Str("Hi!!!".to_string())));
}

#[tokio::test]
async fn size_prefixed_bounds_the_body_substream() {
    let p = SizePrefixed::new(fixed_u8(), byte());
    let bytes = p.encode_to_bytes(&vec![0x2a]).await.unwrap();
    assert_eq!(bytes, vec![1, 0x2a]);
    assert_eq!(p.decode_from_bytes(&bytes, true).await.unwrap(), vec![0x2a]);
}
