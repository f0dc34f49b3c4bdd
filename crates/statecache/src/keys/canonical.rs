//! Conversion of arguments into their canonical JSON form.
//!
//! This mirrors `serde_json::to_value`, except for floats that JSON cannot represent: `NaN` and
//! the infinities become `{"$float": "NaN" | "Infinity" | "-Infinity"}` instead of `null`, so
//! they neither collide with each other nor with `None`.

use serde::Serialize;
use serde::ser::{self, Error as _, Serializer as _};
use serde_json::value::Serializer as ValueSerializer;
use serde_json::{Error, Map, Value};

/// Object key tagging floats without a JSON number representation.
pub const FLOAT_TAG: &str = "$float";

pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, Error> {
    value.serialize(Canonical)
}

fn non_finite(value: f64) -> Value {
    let name = if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    };
    let mut map = Map::new();
    map.insert(FLOAT_TAG.to_owned(), Value::String(name.to_owned()));
    Value::Object(map)
}

/// Renders a serialized map key the way `serde_json` does.
fn map_key(key: Value) -> Result<String, Error> {
    match key {
        Value::String(key) => Ok(key),
        Value::Number(key) => Ok(key.to_string()),
        Value::Bool(key) => Ok(key.to_string()),
        _ => Err(Error::custom("key must be a string")),
    }
}

struct Canonical;

impl ser::Serializer for Canonical {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = TupleVariantBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = StructVariantBuilder;

    fn serialize_bool(self, v: bool) -> Result<Value, Error> {
        ValueSerializer.serialize_bool(v)
    }

    fn serialize_i8(self, v: i8) -> Result<Value, Error> {
        ValueSerializer.serialize_i8(v)
    }

    fn serialize_i16(self, v: i16) -> Result<Value, Error> {
        ValueSerializer.serialize_i16(v)
    }

    fn serialize_i32(self, v: i32) -> Result<Value, Error> {
        ValueSerializer.serialize_i32(v)
    }

    fn serialize_i64(self, v: i64) -> Result<Value, Error> {
        ValueSerializer.serialize_i64(v)
    }

    fn serialize_i128(self, v: i128) -> Result<Value, Error> {
        ValueSerializer.serialize_i128(v)
    }

    fn serialize_u8(self, v: u8) -> Result<Value, Error> {
        ValueSerializer.serialize_u8(v)
    }

    fn serialize_u16(self, v: u16) -> Result<Value, Error> {
        ValueSerializer.serialize_u16(v)
    }

    fn serialize_u32(self, v: u32) -> Result<Value, Error> {
        ValueSerializer.serialize_u32(v)
    }

    fn serialize_u64(self, v: u64) -> Result<Value, Error> {
        ValueSerializer.serialize_u64(v)
    }

    fn serialize_u128(self, v: u128) -> Result<Value, Error> {
        ValueSerializer.serialize_u128(v)
    }

    fn serialize_f32(self, v: f32) -> Result<Value, Error> {
        if v.is_finite() {
            ValueSerializer.serialize_f32(v)
        } else {
            Ok(non_finite(f64::from(v)))
        }
    }

    fn serialize_f64(self, v: f64) -> Result<Value, Error> {
        if v.is_finite() {
            ValueSerializer.serialize_f64(v)
        } else {
            Ok(non_finite(v))
        }
    }

    fn serialize_char(self, v: char) -> Result<Value, Error> {
        ValueSerializer.serialize_char(v)
    }

    fn serialize_str(self, v: &str) -> Result<Value, Error> {
        ValueSerializer.serialize_str(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, Error> {
        ValueSerializer.serialize_bytes(v)
    }

    fn serialize_none(self) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Value, Error> {
        Ok(Value::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, Error> {
        let mut map = Map::new();
        map.insert(variant.to_owned(), value.serialize(self)?);
        Ok(Value::Object(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, Error> {
        Ok(SeqBuilder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqBuilder, Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<TupleVariantBuilder, Error> {
        Ok(TupleVariantBuilder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, Error> {
        Ok(MapBuilder {
            map: Map::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapBuilder, Error> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<StructVariantBuilder, Error> {
        Ok(StructVariantBuilder {
            variant,
            map: Map::new(),
        })
    }
}

struct SeqBuilder {
    items: Vec<Value>,
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value, Error> {
        Ok(Value::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, Error> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, Error> {
        ser::SerializeSeq::end(self)
    }
}

struct TupleVariantBuilder {
    variant: &'static str,
    items: Vec<Value>,
}

impl ser::SerializeTupleVariant for TupleVariantBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value, Error> {
        let mut map = Map::new();
        map.insert(self.variant.to_owned(), Value::Array(self.items));
        Ok(Value::Object(map))
    }
}

struct MapBuilder {
    map: Map<String, Value>,
    next_key: Option<String>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Error> {
        self.next_key = Some(map_key(to_value(key)?)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| Error::custom("map value serialized before its key"))?;
        self.map.insert(key, to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value, Error> {
        Ok(Value::Object(self.map))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.map.insert(key.to_owned(), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value, Error> {
        Ok(Value::Object(self.map))
    }
}

struct StructVariantBuilder {
    variant: &'static str,
    map: Map<String, Value>,
}

impl ser::SerializeStructVariant for StructVariantBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.map.insert(key.to_owned(), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value, Error> {
        let mut map = Map::new();
        map.insert(self.variant.to_owned(), Value::Object(self.map));
        Ok(Value::Object(map))
    }
}
