use std::collections::HashMap;
use std::io::{self, Read, Write};

use log::debug;

use crate::dispatch::{NativeCode, Resolution};
use crate::heap::Heap;
use crate::object::{ObjRef, ObjectData};
use crate::variable::VariableDictionary;

pub const IMAGE_MAGIC: &[u8; 8] = b"RYXIMG\0\0";
pub const IMAGE_VERSION: u32 = 1;

// object tags in the image stream
const TAG_STRING: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_BUFFER: u8 = 2;
const TAG_ARRAY: u8 = 3;
const TAG_VARIABLES: u8 = 4;
const TAG_NATIVE_CODE: u8 = 5;

/// A flattened object graph: the transitive closure of one root, with
/// every reference rewritten to a position-independent token. Token 0 is
/// the root. Cached routine addresses are dropped; they do not survive
/// the process.
pub struct Envelope {
    objects: Vec<ObjectData>,
}

impl Envelope {
    /// Pack the graph reachable from `root`, breadth-first, assigning
    /// tokens in discovery order.
    pub fn pack(heap: &Heap, root: ObjRef) -> Envelope {
        let mut tokens: HashMap<ObjRef, u32> = HashMap::new();
        let mut queue: Vec<ObjRef> = vec![root];
        tokens.insert(root, 0);

        let mut next = 0;
        while next < queue.len() {
            let current = queue[next];
            next += 1;
            heap.data(current).visit_edges(&mut |edge| {
                if !tokens.contains_key(&edge) {
                    tokens.insert(edge, queue.len() as u32);
                    queue.push(edge);
                }
            });
        }

        let objects = queue
            .iter()
            .map(|&r| {
                let mut data = heap.data(r).clone();
                if let ObjectData::NativeCode(code) = &mut data {
                    code.drop_resolved();
                }
                data.map_edges(&mut |edge| {
                    ObjRef(tokens[&edge])
                });
                data
            })
            .collect();

        Envelope { objects }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Write the graph reachable from `root` as a binary image.
pub fn save_image<W: Write>(
    writer: &mut W,
    heap: &Heap,
    root: ObjRef,
) -> io::Result<()> {
    let envelope = Envelope::pack(heap, root);
    debug!("saving image with {} objects", envelope.object_count());

    writer.write_all(IMAGE_MAGIC)?;
    write_u32(writer, IMAGE_VERSION)?;
    write_u32(writer, envelope.objects.len() as u32)?;
    for data in &envelope.objects {
        write_object(writer, data)?;
    }
    Ok(())
}

/// Read an image back into the heap. Every object gets a fresh slot;
/// token references are rewired to the new handles. Returns the root.
pub fn load_image<R: Read>(
    reader: &mut R,
    heap: &mut Heap,
) -> io::Result<ObjRef> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        return Err(invalid("not an interpreter image"));
    }
    let version = read_u32(reader)?;
    if version != IMAGE_VERSION {
        return Err(invalid(format!(
            "unsupported image version {version}, expected {IMAGE_VERSION}"
        )));
    }

    let count = read_u32(reader)? as usize;
    if count == 0 {
        return Err(invalid("image holds no objects"));
    }
    let mut objects = Vec::with_capacity(count);
    for _ in 0..count {
        objects.push(read_object(reader)?);
    }
    debug!("loaded image with {count} objects");

    // placeholders first, so token rewiring has real handles to target
    let handles: Vec<ObjRef> = (0..count)
        .map(|_| heap.alloc(ObjectData::Integer(0)))
        .collect();
    for (index, mut data) in objects.into_iter().enumerate() {
        data.map_edges(&mut |token| handles[token.0 as usize]);
        heap.replace(handles[index], data);
    }
    Ok(handles[0])
}

fn write_object<W: Write>(writer: &mut W, data: &ObjectData) -> io::Result<()> {
    match data {
        ObjectData::String(s) => {
            write_u8(writer, TAG_STRING)?;
            write_string(writer, s)
        }
        ObjectData::Integer(v) => {
            write_u8(writer, TAG_INTEGER)?;
            write_i64(writer, *v)
        }
        ObjectData::Buffer(buffer) => {
            write_u8(writer, TAG_BUFFER)?;
            write_u32(writer, buffer.length() as u32)?;
            writer.write_all(buffer.data())
        }
        ObjectData::Array(fields) => {
            write_u8(writer, TAG_ARRAY)?;
            write_u32(writer, fields.len() as u32)?;
            for field in fields {
                write_u32(writer, field.0)?;
            }
            Ok(())
        }
        ObjectData::Variables(dict) => {
            write_u8(writer, TAG_VARIABLES)?;
            write_u32(writer, dict.len() as u32)?;
            for name in dict.names() {
                let value =
                    dict.get(&name).and_then(|var| var.value());
                write_string(writer, &name)?;
                match value {
                    Some(token) => {
                        write_u8(writer, 1)?;
                        write_u32(writer, token.0)?;
                    }
                    None => write_u8(writer, 0)?,
                }
            }
            Ok(())
        }
        ObjectData::NativeCode(code) => {
            write_u8(writer, TAG_NATIVE_CODE)?;
            match code.resolution() {
                Resolution::Builtin { index } => {
                    write_u8(writer, 0)?;
                    // by name; table order is not part of the format
                    write_string(
                        writer,
                        crate::dispatch::BUILTINS[*index].name,
                    )
                }
                Resolution::Library {
                    package, routine, ..
                } => {
                    write_u8(writer, 1)?;
                    write_string(writer, package)?;
                    write_string(writer, routine)
                }
            }
        }
    }
}

fn read_object<R: Read>(reader: &mut R) -> io::Result<ObjectData> {
    match read_u8(reader)? {
        TAG_STRING => Ok(ObjectData::String(read_string(reader)?)),
        TAG_INTEGER => Ok(ObjectData::Integer(read_i64(reader)?)),
        TAG_BUFFER => {
            let length = read_u32(reader)? as usize;
            let mut bytes = vec![0u8; length];
            reader.read_exact(&mut bytes)?;
            Ok(ObjectData::Buffer(crate::buffer::Buffer::from_bytes(
                &bytes,
            )))
        }
        TAG_ARRAY => {
            let count = read_u32(reader)? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(ObjRef(read_u32(reader)?));
            }
            Ok(ObjectData::Array(fields))
        }
        TAG_VARIABLES => {
            let count = read_u32(reader)? as usize;
            let mut dict = VariableDictionary::new();
            for _ in 0..count {
                let name = read_string(reader)?;
                if read_u8(reader)? != 0 {
                    let token = ObjRef(read_u32(reader)?);
                    dict.set(&name, token);
                } else {
                    dict.ensure(&name);
                }
            }
            Ok(ObjectData::Variables(dict))
        }
        TAG_NATIVE_CODE => {
            let code = match read_u8(reader)? {
                0 => {
                    let name = read_string(reader)?;
                    NativeCode::builtin(&name).ok_or_else(|| {
                        invalid(format!("unknown builtin {name} in image"))
                    })?
                }
                1 => {
                    let package = read_string(reader)?;
                    let routine = read_string(reader)?;
                    NativeCode::library(&package, &routine)
                }
                other => {
                    return Err(invalid(format!(
                        "bad native code resolution tag {other}"
                    )));
                }
            };
            Ok(ObjectData::NativeCode(code))
        }
        other => Err(invalid(format!("bad object tag {other}"))),
    }
}

// little-endian stream helpers

fn write_u8<W: Write>(writer: &mut W, v: u8) -> io::Result<()> {
    writer.write_all(&[v])
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> io::Result<()> {
    writer.write_all(&v.to_le_bytes())
}

fn write_i64<W: Write>(writer: &mut W, v: i64) -> io::Result<()> {
    writer.write_all(&v.to_le_bytes())
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    write_u32(writer, s.len() as u32)?;
    writer.write_all(s.as_bytes())
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let length = read_u32(reader)? as usize;
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| invalid("image string is not valid utf-8"))
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PackageRegistry;
    use crate::heap::HeapCreateInfo;

    fn heap() -> Heap {
        Heap::new(HeapCreateInfo::default())
    }

    #[test]
    fn graph_round_trips_with_cycles_intact() {
        let mut h = heap();
        let name = h.alloc_string("payroll");
        let count = h.alloc_integer(12);
        let root = h.alloc_array(vec![name, count]);
        // close a cycle back to the root
        if let ObjectData::Array(fields) = h.data_mut(root) {
            fields.push(root);
        }

        let mut image = Vec::new();
        save_image(&mut image, &h, root).unwrap();

        let mut fresh = heap();
        let loaded =
            load_image(&mut image.as_slice(), &mut fresh).unwrap();

        match fresh.data(loaded) {
            ObjectData::Array(fields) => {
                assert_eq!(fields.len(), 3);
                assert_eq!(fresh.string_value(fields[0]), Some("payroll"));
                assert_eq!(fresh.integer_value(fields[1]), Some(12));
                assert_eq!(fields[2], loaded);
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn shared_objects_keep_their_identity() {
        let mut h = heap();
        let shared = h.alloc_string("shared");
        let root = h.alloc_array(vec![shared, shared]);

        let mut image = Vec::new();
        save_image(&mut image, &h, root).unwrap();

        let mut fresh = heap();
        let loaded =
            load_image(&mut image.as_slice(), &mut fresh).unwrap();
        match fresh.data(loaded) {
            ObjectData::Array(fields) => assert_eq!(fields[0], fields[1]),
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn variable_pool_round_trips_names_and_values() {
        let mut h = heap();
        let value = h.alloc_integer(7);
        let pool = h.alloc_variables();
        {
            let dict = h.variables_mut(pool).unwrap();
            dict.set("COUNT", value);
            dict.ensure("EMPTY");
        }

        let mut image = Vec::new();
        save_image(&mut image, &h, pool).unwrap();

        let mut fresh = heap();
        let loaded =
            load_image(&mut image.as_slice(), &mut fresh).unwrap();
        let dict = fresh.variables(loaded).unwrap();
        assert_eq!(dict.names(), vec!["COUNT", "EMPTY"]);
        assert!(!dict.get("EMPTY").unwrap().is_set());
        let count = dict.get("COUNT").unwrap().value().unwrap();
        assert_eq!(fresh.integer_value(count), Some(7));
        // runtime guard state is not persisted
        assert_eq!(dict.reserved_by(), None);
    }

    #[test]
    fn native_code_is_written_unresolved() {
        static PKG: crate::dispatch::PackageEntry =
            crate::dispatch::PackageEntry {
                name: "rximg",
                version: "1.0.0",
                api_no: crate::dispatch::PACKAGE_API_NO,
                loader: None,
                unloader: None,
                routines: &[],
                methods: &[crate::dispatch::RoutineEntry {
                    style: crate::dispatch::RoutineStyle::Method,
                    name: "PING",
                    guarded: false,
                    signature: &[
                        crate::value::TypeTag::Boolean,
                        crate::value::TypeTag::Terminator,
                    ],
                    invoke: |_, slots| {
                        slots[0] = crate::value::ValueDescriptor::Boolean(
                            true,
                        );
                        Ok(())
                    },
                }],
            };
        let mut registry = PackageRegistry::new();
        registry.register(&PKG).unwrap();

        let mut h = heap();
        let mut code = NativeCode::library("rximg", "PING");
        code.resolve(&registry).unwrap();
        assert!(code.is_resolved());
        let root = h.alloc_native_code(code);

        let mut image = Vec::new();
        save_image(&mut image, &h, root).unwrap();

        let mut fresh = heap();
        let loaded =
            load_image(&mut image.as_slice(), &mut fresh).unwrap();
        let reloaded = fresh.native_code_mut(loaded).unwrap();
        assert!(!reloaded.is_resolved());
        // the name-based binding still resolves in the new process
        assert!(reloaded.resolve(&registry).is_ok());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut fresh = heap();
        let err = load_image(&mut &b"NOTANIMG\x01\x00\x00\x00"[..], &mut fresh)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut h = heap();
        let root = h.alloc_integer(1);
        let mut image = Vec::new();
        save_image(&mut image, &h, root).unwrap();
        // corrupt the version field
        image[8] = 0xFF;

        let mut fresh = heap();
        let err =
            load_image(&mut image.as_slice(), &mut fresh).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
