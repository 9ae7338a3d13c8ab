use crate::heap::Heap;
use crate::object::{ObjRef, ObjectData};

/// Type tags of the native calling convention. Signature arrays start with
/// the return tag and end with `Terminator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int32,
    Uint32,
    Int64,
    Double,
    Boolean,
    String,
    Object,
    Terminator,
}

/// One marshalled argument or result slot. `Omitted` records a skipped
/// optional argument, the role the descriptor flags byte played in the
/// C convention.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueDescriptor {
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    Object(ObjRef),
    Omitted,
}

impl ValueDescriptor {
    pub fn tag(&self) -> Option<TypeTag> {
        match self {
            ValueDescriptor::Int32(_) => Some(TypeTag::Int32),
            ValueDescriptor::Uint32(_) => Some(TypeTag::Uint32),
            ValueDescriptor::Int64(_) => Some(TypeTag::Int64),
            ValueDescriptor::Double(_) => Some(TypeTag::Double),
            ValueDescriptor::Boolean(_) => Some(TypeTag::Boolean),
            ValueDescriptor::String(_) => Some(TypeTag::String),
            ValueDescriptor::Object(_) => Some(TypeTag::Object),
            ValueDescriptor::Omitted => None,
        }
    }

    pub fn is_supplied(&self) -> bool {
        !matches!(self, ValueDescriptor::Omitted)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ValueDescriptor::Int32(_)
                | ValueDescriptor::Uint32(_)
                | ValueDescriptor::Int64(_)
        )
    }

    /// Integral kinds widen to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueDescriptor::Int32(v) => Some(i64::from(*v)),
            ValueDescriptor::Uint32(v) => Some(i64::from(*v)),
            ValueDescriptor::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueDescriptor::Double(v) => Some(*v),
            ValueDescriptor::Int32(v) => Some(f64::from(*v)),
            ValueDescriptor::Uint32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ValueDescriptor::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ValueDescriptor::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            ValueDescriptor::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Widening-aware match against a declared parameter tag.
    pub fn matches(&self, tag: TypeTag) -> bool {
        match tag {
            TypeTag::Int32 | TypeTag::Uint32 | TypeTag::Int64 => {
                self.is_integer()
            }
            TypeTag::Double => self.as_f64().is_some(),
            TypeTag::Boolean => matches!(self, ValueDescriptor::Boolean(_)),
            TypeTag::String => matches!(self, ValueDescriptor::String(_)),
            TypeTag::Object => matches!(self, ValueDescriptor::Object(_)),
            TypeTag::Terminator => false,
        }
    }

    /// Marshal into a heap object. Stateless per call; doubles map onto
    /// their bit pattern inside an integer object.
    pub fn into_object(self, heap: &mut Heap) -> ObjRef {
        match self {
            ValueDescriptor::Int32(v) => {
                heap.alloc(ObjectData::Integer(i64::from(v)))
            }
            ValueDescriptor::Uint32(v) => {
                heap.alloc(ObjectData::Integer(i64::from(v)))
            }
            ValueDescriptor::Int64(v) => heap.alloc(ObjectData::Integer(v)),
            ValueDescriptor::Double(v) => {
                heap.alloc(ObjectData::String(format_double(v)))
            }
            ValueDescriptor::Boolean(v) => {
                heap.alloc(ObjectData::Integer(i64::from(v)))
            }
            ValueDescriptor::String(s) => heap.alloc(ObjectData::String(s)),
            ValueDescriptor::Object(r) => r,
            ValueDescriptor::Omitted => {
                heap.alloc(ObjectData::String(String::new()))
            }
        }
    }

    /// Unmarshal from a heap object.
    pub fn from_object(heap: &Heap, r: ObjRef) -> ValueDescriptor {
        match heap.data(r) {
            ObjectData::Integer(v) => ValueDescriptor::Int64(*v),
            ObjectData::String(s) => ValueDescriptor::String(s.clone()),
            _ => ValueDescriptor::Object(r),
        }
    }
}

/// Rexx renders numbers as strings; a double with no fractional part prints
/// like an integer. Whole values outside i64 range keep the float rendering;
/// the cast would saturate.
fn format_double(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 2f64.powi(63) {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Validate supplied arguments against a signature. `signature[0]` is the
/// return tag and the last element the terminator sentinel; `args[0]` is
/// the result slot and is not checked. Returns the index of the first
/// mismatching argument slot.
pub fn check_arguments(
    signature: &[TypeTag],
    args: &[ValueDescriptor],
) -> Result<(), usize> {
    debug_assert_eq!(signature.last(), Some(&TypeTag::Terminator));
    let param_tags = &signature[1..signature.len() - 1];
    for (i, tag) in param_tags.iter().enumerate() {
        let slot = i + 1;
        match args.get(slot) {
            Some(arg) if arg.is_supplied() => {
                if !arg.matches(*tag) {
                    return Err(slot);
                }
            }
            // omitted or missing trailing arguments are allowed
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, HeapCreateInfo};

    #[test]
    fn integral_kinds_widen() {
        assert_eq!(ValueDescriptor::Int32(-5).as_i64(), Some(-5));
        assert_eq!(ValueDescriptor::Uint32(7).as_i64(), Some(7));
        assert_eq!(ValueDescriptor::Int64(1 << 40).as_i64(), Some(1 << 40));
        assert_eq!(ValueDescriptor::Double(1.5).as_i64(), None);
    }

    #[test]
    fn omitted_has_no_tag() {
        assert_eq!(ValueDescriptor::Omitted.tag(), None);
        assert!(!ValueDescriptor::Omitted.is_supplied());
    }

    #[test]
    fn marshal_round_trips_through_the_heap() {
        let mut heap = Heap::new(HeapCreateInfo::default());

        let n = ValueDescriptor::Int32(42).into_object(&mut heap);
        assert_eq!(
            ValueDescriptor::from_object(&heap, n),
            ValueDescriptor::Int64(42)
        );

        let s = ValueDescriptor::String("hello".into()).into_object(&mut heap);
        assert_eq!(
            ValueDescriptor::from_object(&heap, s),
            ValueDescriptor::String("hello".into())
        );
    }

    #[test]
    fn double_rendering_tracks_magnitude() {
        let mut heap = Heap::new(HeapCreateInfo::default());

        // whole values in i64 range print like integers
        let small = ValueDescriptor::Double(3.0).into_object(&mut heap);
        assert_eq!(heap.string_value(small), Some("3"));

        // whole values beyond i64 range keep the float rendering
        let large = ValueDescriptor::Double(1e30).into_object(&mut heap);
        assert_eq!(heap.string_value(large), Some("1e30"));

        let negative =
            ValueDescriptor::Double(-1e30).into_object(&mut heap);
        assert_eq!(heap.string_value(negative), Some("-1e30"));

        let fractional =
            ValueDescriptor::Double(2.5).into_object(&mut heap);
        assert_eq!(heap.string_value(fractional), Some("2.5"));
    }

    #[test]
    fn argument_check_reports_first_mismatch() {
        let sig = &[
            TypeTag::Int32,
            TypeTag::Int32,
            TypeTag::String,
            TypeTag::Terminator,
        ];
        let good = [
            ValueDescriptor::Omitted, // result slot
            ValueDescriptor::Int32(1),
            ValueDescriptor::String("x".into()),
        ];
        assert_eq!(check_arguments(sig, &good), Ok(()));

        let bad = [
            ValueDescriptor::Omitted,
            ValueDescriptor::String("oops".into()),
            ValueDescriptor::String("x".into()),
        ];
        assert_eq!(check_arguments(sig, &bad), Err(1));
    }

    #[test]
    fn omitted_arguments_pass_the_check() {
        let sig = &[
            TypeTag::Int32,
            TypeTag::Int32,
            TypeTag::Int32,
            TypeTag::Terminator,
        ];
        let args = [
            ValueDescriptor::Omitted,
            ValueDescriptor::Int32(1),
            ValueDescriptor::Omitted,
        ];
        assert_eq!(check_arguments(sig, &args), Ok(()));
    }
}
