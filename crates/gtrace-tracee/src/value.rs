use std::fmt;

use gtrace_debugger::MemoryReader;
use gtrace_symbol::{Field, TypeKind, TypeRef, TypeTable};
use indexmap::IndexMap;

/// Maps a runtime-type address inside the target to a debugging-type
/// descriptor.
///
/// Needed to discover the concrete type behind an interface value; the
/// implementation lives in the process layer because the mapping goes
/// through module-data ranges.
pub trait RuntimeTypeResolver {
    fn type_by_runtime_addr(&self, addr: u64) -> Option<TypeRef>;
}

/// A decoded value of the target program.
///
/// Carries no type descriptors; rendering is self-contained.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Bool(bool),

    /// Data pointer. `pointee` is absent for opaque pointers and unreadable
    /// targets.
    Ptr { addr: u64, pointee: Option<Box<Value>> },

    /// Function pointer, never dereferenced.
    Func { addr: u64 },

    Str(String),
    Slice(Vec<Value>),
    Struct(IndexMap<String, Value>),

    /// Interface with its resolved implementation.
    Interface { type_name: String, value: Box<Value> },

    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),

    /// A value that could not be reconstructed.
    Nil,

    /// Placeholder emitted where the parsing depth ran out.
    Truncated,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Complex { re, im } => {
                if *im < 0.0 {
                    write!(f, "({re}{im}i)")
                } else {
                    write!(f, "({re}+{im}i)")
                }
            }
            Self::Bool(v) => write!(f, "{v}"),
            Self::Ptr {
                pointee: Some(pointee),
                ..
            } => write!(f, "&{pointee}"),
            Self::Ptr { addr, pointee: None } => write!(f, "{addr:#x}"),
            Self::Func { addr } => write!(f, "{addr:#x}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Slice(elems) => {
                write!(f, "[]{{")?;
                write_joined(f, elems.iter())?;
                write!(f, "}}")
            }
            Self::Struct(fields) => {
                write!(f, "{{")?;
                write_joined(
                    f,
                    fields.iter().map(|(name, value)| DisplayPair(name, value)),
                )?;
                write!(f, "}}")
            }
            Self::Interface { type_name, value } => write!(f, "{type_name}{value}"),
            Self::Array(elems) => {
                write!(f, "[{}]{{", elems.len())?;
                write_joined(f, elems.iter())?;
                write!(f, "}}")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                write_joined(
                    f,
                    entries.iter().map(|(key, value)| DisplayPair2(key, value)),
                )?;
                write!(f, "}}")
            }
            Self::Nil => write!(f, "nil"),
            Self::Truncated => write!(f, "..."),
        }
    }
}

struct DisplayPair<'a>(&'a str, &'a Value);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}

struct DisplayPair2<'a>(&'a Value, &'a Value);

impl fmt::Display for DisplayPair2<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Reconstructs typed values from raw memory.
pub struct ValueDecoder<'a, R: MemoryReader> {
    reader: &'a R,
    types: &'a TypeTable,
    resolver: &'a dyn RuntimeTypeResolver,
}

impl<'a, R: MemoryReader> ValueDecoder<'a, R> {
    pub fn new(
        reader: &'a R,
        types: &'a TypeTable,
        resolver: &'a dyn RuntimeTypeResolver,
    ) -> Self {
        Self {
            reader,
            types,
            resolver,
        }
    }

    /// Decodes `raw` as a value of type `typ`.
    ///
    /// `depth` bounds the descent through pointers, slice elements, map
    /// entries and interface payloads; where it runs out a placeholder is
    /// produced instead. `None` means the value could not be reconstructed
    /// at all; memory-read failures inside composites degrade to [`Value::Nil`]
    /// members rather than failing the whole value.
    pub fn decode(&self, typ: TypeRef, raw: &[u8], depth: usize) -> Option<Value> {
        let descriptor = self.types.get(typ);
        let size = descriptor.size as usize;

        match &descriptor.kind {
            TypeKind::Int => match size {
                1 => Some(Value::Int(raw.first().map(|&b| b as i8 as i64)?)),
                2 => Some(Value::Int(i16::from_le_bytes(array(raw)?) as i64)),
                4 => Some(Value::Int(i32::from_le_bytes(array(raw)?) as i64)),
                8 => Some(Value::Int(i64::from_le_bytes(array(raw)?))),
                _ => None,
            },

            TypeKind::Uint => match size {
                1 => Some(Value::Uint(raw.first().map(|&b| b as u64)?)),
                2 => Some(Value::Uint(u16::from_le_bytes(array(raw)?) as u64)),
                4 => Some(Value::Uint(u32::from_le_bytes(array(raw)?) as u64)),
                8 => Some(Value::Uint(u64::from_le_bytes(array(raw)?))),
                _ => None,
            },

            TypeKind::Float => match size {
                4 => Some(Value::Float(f32::from_le_bytes(array(raw)?) as f64)),
                8 => Some(Value::Float(f64::from_le_bytes(array(raw)?))),
                _ => None,
            },

            TypeKind::Complex => match size {
                8 => Some(Value::Complex {
                    re: f32::from_le_bytes(array(raw.get(0..4)?)?) as f64,
                    im: f32::from_le_bytes(array(raw.get(4..8)?)?) as f64,
                }),
                16 => Some(Value::Complex {
                    re: f64::from_le_bytes(array(raw.get(0..8)?)?),
                    im: f64::from_le_bytes(array(raw.get(8..16)?)?),
                }),
                _ => None,
            },

            TypeKind::Bool => Some(Value::Bool(*raw.first()? == 1)),

            TypeKind::Pointer { pointee } => self.decode_pointer(*pointee, raw, depth),

            TypeKind::Function => Some(Value::Func {
                addr: le_u64(raw)?,
            }),

            TypeKind::Struct { fields } => match descriptor.name.as_str() {
                "string" => self.decode_string(raw),
                "runtime.iface" => self.decode_interface(fields, raw, depth),
                name if name.starts_with("[]") => self.decode_slice(fields, raw, depth),
                _ => self.decode_struct(fields, raw, depth),
            },

            TypeKind::Array { element, count } => {
                if *count < 0 {
                    return None;
                }

                let stride = self.types.get(*element).size as usize;
                let elems = (0..*count as usize)
                    .map(|i| {
                        raw.get(i * stride..(i + 1) * stride)
                            .and_then(|bytes| self.decode(*element, bytes, depth))
                            .unwrap_or(Value::Nil)
                    })
                    .collect();

                Some(Value::Array(elems))
            }

            TypeKind::Typedef { underlying } => {
                if descriptor.name.starts_with("map[") {
                    self.decode_map((*underlying)?, raw, depth)
                } else {
                    self.decode((*underlying)?, raw, depth)
                }
            }

            TypeKind::Unsupported => None,
        }
    }

    fn decode_pointer(&self, pointee: Option<TypeRef>, raw: &[u8], depth: usize) -> Option<Value> {
        let addr = le_u64(raw)?;
        if addr == 0 {
            return None;
        }

        let Some(pointee) = pointee else {
            return Some(Value::Ptr { addr, pointee: None });
        };

        if depth == 0 {
            return Some(Value::Ptr {
                addr,
                pointee: Some(Box::new(Value::Truncated)),
            });
        }

        let mut buf = vec![0u8; self.types.get(pointee).size as usize];
        if self.reader.read_memory(addr, &mut buf).is_err() {
            return None;
        }

        Some(Value::Ptr {
            addr,
            pointee: self.decode(pointee, &buf, depth - 1).map(Box::new),
        })
    }

    /// `string` header: `{ptr, len}`; the content is fetched from `ptr`.
    fn decode_string(&self, raw: &[u8]) -> Option<Value> {
        let addr = le_u64(raw.get(0..8)?)?;
        let len = le_u64(raw.get(8..16)?)? as usize;

        let mut buf = vec![0u8; len];
        if self.reader.read_memory(addr, &mut buf).is_err() {
            return None;
        }

        Some(Value::Str(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Slice header: `{array, len, cap}`; `len` elements are read
    /// contiguously from `array`.
    fn decode_slice(&self, fields: &[Field], raw: &[u8], depth: usize) -> Option<Value> {
        if depth == 0 {
            return Some(Value::Truncated);
        }

        let array_field = fields.iter().find(|f| f.name == "array")?;
        let len_field = fields.iter().find(|f| f.name == "len")?;

        let base = le_u64(raw.get(array_field.offset as usize..)?)?;
        let len = le_u64(raw.get(len_field.offset as usize..)?)? as usize;

        let element = match self.types.get(self.types.strip_typedefs(array_field.typ)).kind {
            TypeKind::Pointer {
                pointee: Some(element),
            } => element,
            _ => return None,
        };
        let stride = self.types.get(element).size;

        let elems = (0..len)
            .map(|i| {
                let mut buf = vec![0u8; stride as usize];
                match self.reader.read_memory(base + i as u64 * stride, &mut buf) {
                    Ok(()) => self
                        .decode(element, &buf, depth - 1)
                        .unwrap_or(Value::Nil),
                    Err(_) => Value::Nil,
                }
            })
            .collect();

        Some(Value::Slice(elems))
    }

    /// `runtime.iface`: `{tab, data}`. The concrete type comes from
    /// `tab._type` through the runtime-type resolver, then `data` is decoded
    /// as that type.
    fn decode_interface(&self, fields: &[Field], raw: &[u8], depth: usize) -> Option<Value> {
        if depth == 0 {
            return Some(Value::Truncated);
        }

        let tab_field = fields.iter().find(|f| f.name == "tab")?;
        let data_field = fields.iter().find(|f| f.name == "data")?;

        let tab_addr = le_u64(raw.get(tab_field.offset as usize..)?)?;
        let data_addr = le_u64(raw.get(data_field.offset as usize..)?)?;
        if tab_addr == 0 {
            return None;
        }

        let itab = match self.types.get(self.types.strip_typedefs(tab_field.typ)).kind {
            TypeKind::Pointer {
                pointee: Some(itab),
            } => itab,
            _ => return None,
        };
        let type_field = self.types.field(itab, "_type")?;

        let runtime_type_addr = self.read_u64(tab_addr + type_field.offset)?;
        let impl_type = self.resolver.type_by_runtime_addr(runtime_type_addr)?;

        let mut buf = vec![0u8; self.types.get(impl_type).size as usize];
        if self.reader.read_memory(data_addr, &mut buf).is_err() {
            return None;
        }

        Some(Value::Interface {
            type_name: self.types.get(impl_type).name.clone(),
            value: Box::new(self.decode(impl_type, &buf, depth - 1).unwrap_or(Value::Nil)),
        })
    }

    fn decode_struct(&self, fields: &[Field], raw: &[u8], depth: usize) -> Option<Value> {
        let mut decoded = IndexMap::with_capacity(fields.len());

        for field in fields {
            let size = self.types.get(field.typ).size as usize;
            let value = raw
                .get(field.offset as usize..field.offset as usize + size)
                .and_then(|bytes| self.decode(field.typ, bytes, depth))
                .unwrap_or(Value::Nil);

            decoded.insert(field.name.clone(), value);
        }

        Some(Value::Struct(decoded))
    }

    /// Hash map decoding: dereference to the `hmap` header, then walk the
    /// `1 << B` buckets, reading up to eight entries per bucket. Entries
    /// whose `tophash` is zero are vacant. Overflow buckets are not
    /// followed, so maps with deep collisions show partial contents.
    fn decode_map(&self, underlying: TypeRef, raw: &[u8], depth: usize) -> Option<Value> {
        if depth == 0 {
            return Some(Value::Truncated);
        }

        let hmap = match self.types.get(self.types.strip_typedefs(underlying)).kind {
            TypeKind::Pointer {
                pointee: Some(hmap),
            } => hmap,
            _ => return None,
        };

        let hmap_addr = le_u64(raw)?;
        if hmap_addr == 0 {
            return None;
        }

        let mut hmap_raw = vec![0u8; self.types.get(hmap).size as usize];
        if self.reader.read_memory(hmap_addr, &mut hmap_raw).is_err() {
            return None;
        }

        let b_field = self.types.field(hmap, "B")?;
        let buckets_field = self.types.field(hmap, "buckets")?;

        let bucket_count = 1u64 << *hmap_raw.get(b_field.offset as usize)?;
        let buckets_addr = le_u64(hmap_raw.get(buckets_field.offset as usize..)?)?;
        if buckets_addr == 0 {
            return Some(Value::Map(Vec::new()));
        }

        let bucket_type = match self
            .types
            .get(self.types.strip_typedefs(buckets_field.typ))
            .kind
        {
            TypeKind::Pointer {
                pointee: Some(bucket),
            } => bucket,
            _ => return None,
        };
        let bucket_size = self.types.get(bucket_type).size;

        let tophash = self.types.field(bucket_type, "tophash")?;
        let keys = self.types.field(bucket_type, "keys")?;
        let values = self.types.field(bucket_type, "values")?;

        let (key_type, key_size) = array_element(self.types, keys.typ)?;
        let (value_type, value_size) = array_element(self.types, values.typ)?;

        let mut entries = Vec::new();

        for i in 0..bucket_count {
            let mut bucket_raw = vec![0u8; bucket_size as usize];
            if self
                .reader
                .read_memory(buckets_addr + i * bucket_size, &mut bucket_raw)
                .is_err()
            {
                continue;
            }

            for slot in 0..8u64 {
                let hash = *bucket_raw.get((tophash.offset + slot) as usize)?;
                if hash == 0 {
                    continue;
                }

                let key = bucket_raw
                    .get((keys.offset + slot * key_size) as usize..)
                    .and_then(|bytes| self.decode(key_type, bytes, depth - 1))
                    .unwrap_or(Value::Nil);
                let value = bucket_raw
                    .get((values.offset + slot * value_size) as usize..)
                    .and_then(|bytes| self.decode(value_type, bytes, depth - 1))
                    .unwrap_or(Value::Nil);

                entries.push((key, value));
            }
        }

        Some(Value::Map(entries))
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_memory(addr, &mut buf).ok()?;
        Some(u64::from_le_bytes(buf))
    }
}

fn array_element(types: &TypeTable, r: TypeRef) -> Option<(TypeRef, u64)> {
    match types.get(types.strip_typedefs(r)).kind {
        TypeKind::Array { element, .. } => Some((element, types.get(element).size)),
        _ => None,
    }
}

fn le_u64(raw: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(array(raw.get(0..8)?)?))
}

fn array<const N: usize>(raw: &[u8]) -> Option<[u8; N]> {
    raw.get(0..N)?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use gtrace_symbol::TypeDescriptor;

    use super::*;
    use crate::testutil::FakeMemory;

    struct NoResolver;

    impl RuntimeTypeResolver for NoResolver {
        fn type_by_runtime_addr(&self, _addr: u64) -> Option<TypeRef> {
            None
        }
    }

    struct FixedResolver(TypeRef);

    impl RuntimeTypeResolver for FixedResolver {
        fn type_by_runtime_addr(&self, _addr: u64) -> Option<TypeRef> {
            Some(self.0)
        }
    }

    struct Fixture {
        types: TypeTable,
        int: TypeRef,
        uint8: TypeRef,
        bool_t: TypeRef,
        string: TypeRef,
        int_slice: TypeRef,
        int_ptr: TypeRef,
        point: TypeRef,
    }

    fn push(types: &mut TypeTable, name: &str, size: u64, kind: TypeKind) -> TypeRef {
        types.push(TypeDescriptor {
            name: name.to_owned(),
            size,
            kind,
        })
    }

    fn fixture() -> Fixture {
        let mut types = TypeTable::new();

        let int = push(&mut types, "int", 8, TypeKind::Int);
        let uint8 = push(&mut types, "uint8", 1, TypeKind::Uint);
        let bool_t = push(&mut types, "bool", 1, TypeKind::Bool);
        let uint8_ptr = push(
            &mut types,
            "*uint8",
            8,
            TypeKind::Pointer {
                pointee: Some(uint8),
            },
        );
        let int_ptr = push(
            &mut types,
            "*int",
            8,
            TypeKind::Pointer { pointee: Some(int) },
        );

        let string = push(
            &mut types,
            "string",
            16,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "str".to_owned(),
                        offset: 0,
                        typ: uint8_ptr,
                    },
                    Field {
                        name: "len".to_owned(),
                        offset: 8,
                        typ: int,
                    },
                ],
            },
        );

        let int_slice = push(
            &mut types,
            "[]int",
            24,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "array".to_owned(),
                        offset: 0,
                        typ: int_ptr,
                    },
                    Field {
                        name: "len".to_owned(),
                        offset: 8,
                        typ: int,
                    },
                    Field {
                        name: "cap".to_owned(),
                        offset: 16,
                        typ: int,
                    },
                ],
            },
        );

        let point = push(
            &mut types,
            "main.point",
            16,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "x".to_owned(),
                        offset: 0,
                        typ: int,
                    },
                    Field {
                        name: "y".to_owned(),
                        offset: 8,
                        typ: int,
                    },
                ],
            },
        );

        Fixture {
            types,
            int,
            uint8,
            bool_t,
            string,
            int_slice,
            int_ptr,
            point,
        }
    }

    #[test]
    fn decodes_primitives() {
        let fx = fixture();
        let mem = FakeMemory::new();
        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);

        let raw = (-5i64).to_le_bytes();
        assert_eq!(decoder.decode(fx.int, &raw, 1), Some(Value::Int(-5)));

        assert_eq!(decoder.decode(fx.uint8, &[0xff], 1), Some(Value::Uint(255)));
        assert_eq!(decoder.decode(fx.bool_t, &[1], 1), Some(Value::Bool(true)));
    }

    #[test]
    fn decodes_strings_from_memory() {
        let fx = fixture();
        let mem = FakeMemory::new();
        mem.load(0x2000, b"hello");

        let mut raw = Vec::new();
        raw.extend_from_slice(&0x2000u64.to_le_bytes());
        raw.extend_from_slice(&5u64.to_le_bytes());

        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);
        let value = decoder.decode(fx.string, &raw, 1).unwrap();

        assert_eq!(value, Value::Str("hello".to_owned()));
        assert_eq!(value.to_string(), r#""hello""#);
    }

    #[test]
    fn decodes_slices_element_by_element() {
        let fx = fixture();
        let mem = FakeMemory::new();
        mem.load_u64(0x3000, 7u64);
        mem.load_u64(0x3008, 9u64);

        let mut raw = Vec::new();
        raw.extend_from_slice(&0x3000u64.to_le_bytes());
        raw.extend_from_slice(&2u64.to_le_bytes());
        raw.extend_from_slice(&2u64.to_le_bytes());

        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);
        let value = decoder.decode(fx.int_slice, &raw, 2).unwrap();

        assert_eq!(value, Value::Slice(vec![Value::Int(7), Value::Int(9)]));
        assert_eq!(value.to_string(), "[]{7, 9}");
    }

    #[test]
    fn nil_pointer_is_unparseable() {
        let fx = fixture();
        let mem = FakeMemory::new();
        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);

        assert_eq!(decoder.decode(fx.int_ptr, &0u64.to_le_bytes(), 3), None);
    }

    #[test]
    fn pointer_descent_honors_depth() {
        let fx = fixture();
        let mem = FakeMemory::new();
        mem.load_u64(0x4000, 11u64);

        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);
        let raw = 0x4000u64.to_le_bytes();

        let deep = decoder.decode(fx.int_ptr, &raw, 1).unwrap();
        assert_eq!(deep.to_string(), "&11");

        let shallow = decoder.decode(fx.int_ptr, &raw, 0).unwrap();
        assert_eq!(shallow.to_string(), "&...");
    }

    #[test]
    fn struct_fields_keep_declaration_order() {
        let fx = fixture();
        let mem = FakeMemory::new();
        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);

        let mut raw = Vec::new();
        raw.extend_from_slice(&1i64.to_le_bytes());
        raw.extend_from_slice(&2i64.to_le_bytes());

        let value = decoder.decode(fx.point, &raw, 1).unwrap();
        assert_eq!(value.to_string(), "{x: 1, y: 2}");
    }

    #[test]
    fn decodes_interfaces_through_the_resolver() {
        let mut fx = fixture();

        let rtype_ptr = push(
            &mut fx.types,
            "*runtime._type",
            8,
            TypeKind::Pointer { pointee: None },
        );
        let itab = push(
            &mut fx.types,
            "runtime.itab",
            16,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "inter".to_owned(),
                        offset: 0,
                        typ: rtype_ptr,
                    },
                    Field {
                        name: "_type".to_owned(),
                        offset: 8,
                        typ: rtype_ptr,
                    },
                ],
            },
        );
        let itab_ptr = push(
            &mut fx.types,
            "*runtime.itab",
            8,
            TypeKind::Pointer {
                pointee: Some(itab),
            },
        );
        let data_ptr = push(&mut fx.types, "*void", 8, TypeKind::Pointer { pointee: None });
        let iface = push(
            &mut fx.types,
            "runtime.iface",
            16,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "tab".to_owned(),
                        offset: 0,
                        typ: itab_ptr,
                    },
                    Field {
                        name: "data".to_owned(),
                        offset: 8,
                        typ: data_ptr,
                    },
                ],
            },
        );

        let mem = FakeMemory::new();
        mem.load_u64(0x5008, 0x9000); // itab._type
        mem.load_u64(0x6000, 42u64); // payload

        let mut raw = Vec::new();
        raw.extend_from_slice(&0x5000u64.to_le_bytes());
        raw.extend_from_slice(&0x6000u64.to_le_bytes());

        let resolver = FixedResolver(fx.int);
        let decoder = ValueDecoder::new(&mem, &fx.types, &resolver);

        let value = decoder.decode(iface, &raw, 2).unwrap();
        assert_eq!(value.to_string(), "int42");
    }

    #[test]
    fn decodes_maps_and_skips_vacant_slots() {
        let mut fx = fixture();

        // reduced hmap/bucket layout: B at +8, buckets at +16
        let tophash_array = push(
            &mut fx.types,
            "[8]uint8",
            8,
            TypeKind::Array {
                element: fx.uint8,
                count: 8,
            },
        );
        let keys_array = push(
            &mut fx.types,
            "[8]int",
            64,
            TypeKind::Array {
                element: fx.int,
                count: 8,
            },
        );
        let bucket = push(
            &mut fx.types,
            "map.bucket[int]int",
            8 + 64 + 64,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "tophash".to_owned(),
                        offset: 0,
                        typ: tophash_array,
                    },
                    Field {
                        name: "keys".to_owned(),
                        offset: 8,
                        typ: keys_array,
                    },
                    Field {
                        name: "values".to_owned(),
                        offset: 72,
                        typ: keys_array,
                    },
                ],
            },
        );

        let bucket_ptr = push(
            &mut fx.types,
            "*map.bucket[int]int",
            8,
            TypeKind::Pointer {
                pointee: Some(bucket),
            },
        );
        let hmap = push(
            &mut fx.types,
            "runtime.hmap",
            24,
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "count".to_owned(),
                        offset: 0,
                        typ: fx.int,
                    },
                    Field {
                        name: "B".to_owned(),
                        offset: 8,
                        typ: fx.uint8,
                    },
                    Field {
                        name: "buckets".to_owned(),
                        offset: 16,
                        typ: bucket_ptr,
                    },
                ],
            },
        );
        let hmap_ptr = push(
            &mut fx.types,
            "*runtime.hmap",
            8,
            TypeKind::Pointer {
                pointee: Some(hmap),
            },
        );
        let map_t = push(
            &mut fx.types,
            "map[int]int",
            8,
            TypeKind::Typedef {
                underlying: Some(hmap_ptr),
            },
        );

        let mem = FakeMemory::new();

        // hmap at 0x7000: count=1, B=0 (one bucket), buckets at 0x8000
        mem.load_u64(0x7000, 1);
        mem.load(0x7008, &[0u8; 8]);
        mem.load_u64(0x7010, 0x8000);

        // bucket: slot 0 occupied, the rest vacant
        let mut bucket_raw = vec![0u8; 8 + 64 + 64];
        bucket_raw[0] = 0x11;
        bucket_raw[8..16].copy_from_slice(&3i64.to_le_bytes());
        bucket_raw[72..80].copy_from_slice(&30i64.to_le_bytes());
        mem.load(0x8000, &bucket_raw);

        let decoder = ValueDecoder::new(&mem, &fx.types, &NoResolver);
        let value = decoder.decode(map_t, &0x7000u64.to_le_bytes(), 2).unwrap();

        assert_eq!(value, Value::Map(vec![(Value::Int(3), Value::Int(30))]));
        assert_eq!(value.to_string(), "{3: 30}");
    }
}

