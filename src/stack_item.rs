//! Polymorphic script values.
//!
//! Every [`StackItem`] is array-shaped: a sequence of element slots of a
//! single kind, with scalars represented as length-1 sequences. The
//! interpreter's elementwise opcodes run over these slots; the typed views
//! convert between kinds and return `None` where a conversion is undefined,
//! which the interpreter maps to a fault.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::Zero;

/// Canonical byte encoding of an integer: little-endian two's-complement,
/// minimal length, with zero encoded as the empty string.
pub fn encode_integer(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        Vec::new()
    } else {
        value.to_signed_bytes_le()
    }
}

/// Inverse of [`encode_integer`]; the empty string decodes to zero.
pub fn decode_integer(bytes: &[u8]) -> BigInt {
    if bytes.is_empty() {
        BigInt::zero()
    } else {
        BigInt::from_signed_bytes_le(bytes)
    }
}

/// Opaque handle pushed by interop services.
///
/// Scripts cannot inspect the wrapped value; they can only move it around and
/// hand it back to the host, which downcasts it. Handles compare by identity.
#[derive(Clone)]
pub struct InteropObject(Rc<dyn Any>);

impl InteropObject {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for InteropObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InteropObject")
    }
}

/// A tagged, array-shaped script value.
#[derive(Clone, Debug)]
pub enum StackItem {
    /// Raw byte-strings.
    Bytes(Vec<Vec<u8>>),
    /// Arbitrary-precision signed integers.
    Int(Vec<BigInt>),
    /// Booleans.
    Bool(Vec<bool>),
    /// Nested polymorphic sequence.
    Array(Vec<StackItem>),
    /// Opaque host handle; always scalar.
    Interop(InteropObject),
}

impl StackItem {
    /// Number of element slots. Fixed for the lifetime of the item.
    pub fn count(&self) -> usize {
        match self {
            StackItem::Bytes(v) => v.len(),
            StackItem::Int(v) => v.len(),
            StackItem::Bool(v) => v.len(),
            StackItem::Array(v) => v.len(),
            StackItem::Interop(_) => 1,
        }
    }

    /// View as a sequence of raw byte-strings.
    ///
    /// Integers encode canonically, booleans as `[1]` / empty, and array
    /// elements contribute their scalar byte coercion. Undefined on interop
    /// handles and on arrays with non-scalar elements.
    pub fn as_bytes_array(&self) -> Option<Vec<Vec<u8>>> {
        match self {
            StackItem::Bytes(v) => Some(v.clone()),
            StackItem::Int(v) => Some(v.iter().map(encode_integer).collect()),
            StackItem::Bool(v) => Some(v.iter().map(|&b| bool_bytes(b)).collect()),
            StackItem::Array(v) => v.iter().map(StackItem::to_bytes).collect(),
            StackItem::Interop(_) => None,
        }
    }

    /// View as a sequence of integers; empty byte-strings decode to zero.
    pub fn as_int_array(&self) -> Option<Vec<BigInt>> {
        match self {
            StackItem::Bytes(v) => Some(v.iter().map(|b| decode_integer(b)).collect()),
            StackItem::Int(v) => Some(v.clone()),
            StackItem::Bool(v) => Some(v.iter().map(|&b| BigInt::from(b as u8)).collect()),
            StackItem::Array(v) => v.iter().map(StackItem::to_int).collect(),
            StackItem::Interop(_) => None,
        }
    }

    /// View as a sequence of booleans; a byte-string is true iff it has a
    /// non-zero byte.
    pub fn as_bool_array(&self) -> Option<Vec<bool>> {
        match self {
            StackItem::Bytes(v) => Some(v.iter().map(|b| bytes_truthy(b)).collect()),
            StackItem::Int(v) => Some(v.iter().map(|n| !n.is_zero()).collect()),
            StackItem::Bool(v) => Some(v.clone()),
            StackItem::Array(v) => v.iter().map(StackItem::to_bool).collect(),
            StackItem::Interop(_) => None,
        }
    }

    /// The contained items; defined only on the array kind.
    pub fn as_array(&self) -> Option<&[StackItem]> {
        match self {
            StackItem::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean coercion: the AND-fold of [`as_bool_array`], vacuously true
    /// on empty items. Interop handles coerce to true.
    ///
    /// [`as_bool_array`]: StackItem::as_bool_array
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            StackItem::Interop(_) => Some(true),
            _ => Some(self.as_bool_array()?.into_iter().all(|b| b)),
        }
    }

    /// Integer coercion; defined only when `count() == 1`.
    pub fn to_int(&self) -> Option<BigInt> {
        if self.count() != 1 {
            return None;
        }
        self.as_int_array().map(|mut v| v.remove(0))
    }

    /// Byte-string coercion; defined only when `count() == 1`.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        if self.count() != 1 {
            return None;
        }
        self.as_bytes_array().map(|mut v| v.remove(0))
    }

    /// The `index`-th element slot as a scalar item.
    pub fn element(&self, index: usize) -> Option<StackItem> {
        match self {
            StackItem::Bytes(v) => v.get(index).map(|b| StackItem::Bytes(vec![b.clone()])),
            StackItem::Int(v) => v.get(index).map(|n| StackItem::Int(vec![n.clone()])),
            StackItem::Bool(v) => v.get(index).map(|&b| StackItem::Bool(vec![b])),
            StackItem::Array(v) => v.get(index).cloned(),
            StackItem::Interop(_) => None,
        }
    }

    /// Keeps the first `count` slots, saturating at the item length.
    pub fn take_slots(self, count: usize) -> Option<StackItem> {
        fn take<T>(mut v: Vec<T>, count: usize) -> Vec<T> {
            v.truncate(count);
            v
        }
        match self {
            StackItem::Bytes(v) => Some(StackItem::Bytes(take(v, count))),
            StackItem::Int(v) => Some(StackItem::Int(take(v, count))),
            StackItem::Bool(v) => Some(StackItem::Bool(take(v, count))),
            StackItem::Array(v) => Some(StackItem::Array(take(v, count))),
            StackItem::Interop(_) => None,
        }
    }

    /// Drops the first `count` slots, saturating at the item length.
    pub fn skip_slots(self, count: usize) -> Option<StackItem> {
        fn skip<T>(mut v: Vec<T>, count: usize) -> Vec<T> {
            v.drain(..count.min(v.len()));
            v
        }
        match self {
            StackItem::Bytes(v) => Some(StackItem::Bytes(skip(v, count))),
            StackItem::Int(v) => Some(StackItem::Int(skip(v, count))),
            StackItem::Bool(v) => Some(StackItem::Bool(skip(v, count))),
            StackItem::Array(v) => Some(StackItem::Array(skip(v, count))),
            StackItem::Interop(_) => None,
        }
    }

    /// Reverses the slot order in place.
    pub fn reverse_slots(self) -> Option<StackItem> {
        fn rev<T>(mut v: Vec<T>) -> Vec<T> {
            v.reverse();
            v
        }
        match self {
            StackItem::Bytes(v) => Some(StackItem::Bytes(rev(v))),
            StackItem::Int(v) => Some(StackItem::Int(rev(v))),
            StackItem::Bool(v) => Some(StackItem::Bool(rev(v))),
            StackItem::Array(v) => Some(StackItem::Array(rev(v))),
            StackItem::Interop(_) => None,
        }
    }

    /// Removes duplicate slots, keeping the first occurrence of each.
    pub fn distinct_slots(self) -> Option<StackItem> {
        match self {
            StackItem::Bytes(v) => Some(StackItem::Bytes(dedup_preserve(v))),
            StackItem::Int(v) => Some(StackItem::Int(dedup_preserve(v))),
            StackItem::Bool(v) => Some(StackItem::Bool(dedup_preserve(v))),
            StackItem::Array(v) => Some(StackItem::Array(dedup_preserve(v))),
            StackItem::Interop(_) => None,
        }
    }

    /// Concatenates the slot sequences of two items.
    ///
    /// Same-kind operands keep their kind; mixed primitive operands fall
    /// back to the byte-string view. Arrays only concatenate with arrays.
    pub fn concat(self, other: StackItem) -> Option<StackItem> {
        match (self, other) {
            (StackItem::Bytes(mut a), StackItem::Bytes(b)) => {
                a.extend(b);
                Some(StackItem::Bytes(a))
            }
            (StackItem::Int(mut a), StackItem::Int(b)) => {
                a.extend(b);
                Some(StackItem::Int(a))
            }
            (StackItem::Bool(mut a), StackItem::Bool(b)) => {
                a.extend(b);
                Some(StackItem::Bool(a))
            }
            (StackItem::Array(mut a), StackItem::Array(b)) => {
                a.extend(b);
                Some(StackItem::Array(a))
            }
            (StackItem::Interop(_), _)
            | (_, StackItem::Interop(_))
            | (StackItem::Array(_), _)
            | (_, StackItem::Array(_)) => None,
            (a, b) => {
                let mut bytes = a.as_bytes_array()?;
                bytes.extend(b.as_bytes_array()?);
                Some(StackItem::Bytes(bytes))
            }
        }
    }

    /// Distinct slots of `self` that also occur in `other`, in `self` order.
    pub fn intersect(self, other: &StackItem) -> Option<StackItem> {
        match self {
            StackItem::Array(v) => {
                let other = other.as_array()?;
                let kept = dedup_preserve(v)
                    .into_iter()
                    .filter(|item| other.contains(item))
                    .collect();
                Some(StackItem::Array(kept))
            }
            StackItem::Interop(_) => None,
            item => {
                let keep = other.as_bytes_array()?;
                let slots = item.as_bytes_array()?;
                let kept = dedup_preserve(slots)
                    .into_iter()
                    .filter(|b| keep.contains(b))
                    .collect();
                Some(StackItem::Bytes(kept))
            }
        }
    }

    /// Distinct slots of `self` that do not occur in `other`.
    pub fn except(self, other: &StackItem) -> Option<StackItem> {
        match self {
            StackItem::Array(v) => {
                let other = other.as_array()?;
                let kept = dedup_preserve(v)
                    .into_iter()
                    .filter(|item| !other.contains(item))
                    .collect();
                Some(StackItem::Array(kept))
            }
            StackItem::Interop(_) => None,
            item => {
                let drop = other.as_bytes_array()?;
                let slots = item.as_bytes_array()?;
                let kept = dedup_preserve(slots)
                    .into_iter()
                    .filter(|b| !drop.contains(b))
                    .collect();
                Some(StackItem::Bytes(kept))
            }
        }
    }
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn bytes_truthy(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b != 0)
}

fn dedup_preserve<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Equality follows the reference engine: primitive kinds compare through
/// their byte-string views (so `Int(1)` equals `Bytes([0x01])`), arrays
/// compare elementwise, interop handles by identity.
impl PartialEq for StackItem {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StackItem::Array(a), StackItem::Array(b)) => a == b,
            (StackItem::Interop(a), StackItem::Interop(b)) => a.ptr_eq(b),
            (StackItem::Array(_), _)
            | (_, StackItem::Array(_))
            | (StackItem::Interop(_), _)
            | (_, StackItem::Interop(_)) => false,
            _ => self.as_bytes_array() == other.as_bytes_array(),
        }
    }
}

impl Eq for StackItem {}

impl From<Vec<u8>> for StackItem {
    fn from(bytes: Vec<u8>) -> Self {
        StackItem::Bytes(vec![bytes])
    }
}

impl From<&[u8]> for StackItem {
    fn from(bytes: &[u8]) -> Self {
        StackItem::Bytes(vec![bytes.to_vec()])
    }
}

impl From<BigInt> for StackItem {
    fn from(value: BigInt) -> Self {
        StackItem::Int(vec![value])
    }
}

impl From<i64> for StackItem {
    fn from(value: i64) -> Self {
        StackItem::Int(vec![BigInt::from(value)])
    }
}

impl From<bool> for StackItem {
    fn from(value: bool) -> Self {
        StackItem::Bool(vec![value])
    }
}

impl From<Vec<StackItem>> for StackItem {
    fn from(items: Vec<StackItem>) -> Self {
        StackItem::Array(items)
    }
}
