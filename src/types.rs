//! Type representation for the Skarn analyzer
//!
//! Types are interned: structural identity for primitives, pointers and
//! arrays, nominal identity (by generated codename) for records, unions and
//! enums. Every expression node that reaches code generation carries one of
//! these interned types. The `codename` of a type is the stable token used
//! to derive C identifiers for the type itself and for per-type helpers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub type TypeRef = Rc<Type>;

/// An integer shape: bit width, signedness, and whether it is the
/// pointer-sized `isize`/`usize` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntKind {
    pub bits: u8,
    pub signed: bool,
    pub ptr_sized: bool,
}

/// A named field of a record or union
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeRef,
}

/// Shared shape of records and unions
#[derive(Debug)]
pub struct Composite {
    pub name: String,
    pub codename: String,
    pub fields: Vec<Field>,
}

impl Composite {
    /// The `__tostring` print hook: a function field whose first return is
    /// a string view
    pub fn tostring_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| {
            f.name == "__tostring"
                && match &*f.ty {
                    Type::Function { rets, .. } => {
                        matches!(rets.first().map(|r| &**r), Some(Type::StringView))
                    }
                    _ => false,
                }
        })
    }
}

#[derive(Debug)]
pub enum Type {
    Int(IntKind),
    Float { bits: u8 },
    Boolean,
    StringView,
    CString,
    Niltype,
    Nilptr,
    Void,
    /// `Pointer(None)` is the untyped `pointer` primitive
    Pointer(Option<TypeRef>),
    Array { elem: TypeRef, len: u64 },
    Record(Rc<Composite>),
    Union(Rc<Composite>),
    Enum {
        name: String,
        codename: String,
        subtype: TypeRef,
        fields: Vec<(String, i128)>,
    },
    Function { args: Vec<TypeRef>, rets: Vec<TypeRef> },
    /// The type of types; values of this type are types themselves
    TypeType,
    /// Placeholder for polymorphic parameters, replaced at instantiation
    Auto,
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        use Type::*;
        match (self, other) {
            (Int(a), Int(b)) => a == b,
            (Float { bits: a }, Float { bits: b }) => a == b,
            (Boolean, Boolean)
            | (StringView, StringView)
            | (CString, CString)
            | (Niltype, Niltype)
            | (Nilptr, Nilptr)
            | (Void, Void)
            | (TypeType, TypeType)
            | (Auto, Auto) => true,
            (Pointer(a), Pointer(b)) => a == b,
            (Array { elem: e1, len: l1 }, Array { elem: e2, len: l2 }) => l1 == l2 && e1 == e2,
            // Nominal identity for composites and enums
            (Record(a), Record(b)) => a.codename == b.codename,
            (Union(a), Union(b)) => a.codename == b.codename,
            (Enum { codename: a, .. }, Enum { codename: b, .. }) => a == b,
            (Function { args: a1, rets: r1 }, Function { args: a2, rets: r2 }) => {
                a1 == a2 && r1 == r2
            }
            _ => false,
        }
    }
}

impl Type {
    /// Source-level name of the type
    pub fn name(&self) -> String {
        match self {
            Type::Int(k) if k.ptr_sized => {
                if k.signed { "isize".into() } else { "usize".into() }
            }
            Type::Int(k) => {
                if k.signed {
                    format!("int{}", k.bits)
                } else {
                    format!("uint{}", k.bits)
                }
            }
            Type::Float { bits } => format!("float{}", bits),
            Type::Boolean => "boolean".into(),
            Type::StringView => "stringview".into(),
            Type::CString => "cstring".into(),
            Type::Niltype => "niltype".into(),
            Type::Nilptr => "nilptr".into(),
            Type::Void => "void".into(),
            Type::Pointer(None) => "pointer".into(),
            Type::Pointer(Some(elem)) => format!("pointer({})", elem.name()),
            Type::Array { elem, len } => format!("array({}, {})", elem.name(), len),
            Type::Record(c) => c.name.clone(),
            Type::Union(c) => c.name.clone(),
            Type::Enum { name, .. } => name.clone(),
            Type::Function { args, rets } => {
                let args: Vec<String> = args.iter().map(|t| t.name()).collect();
                let rets: Vec<String> = rets.iter().map(|t| t.name()).collect();
                format!("function({}): {}", args.join(", "), rets.join(", "))
            }
            Type::TypeType => "type".into(),
            Type::Auto => "auto".into(),
        }
    }

    /// Stable token used to derive C identifiers
    pub fn codename(&self) -> String {
        match self {
            Type::Pointer(None) => "pointer".into(),
            Type::Pointer(Some(elem)) => format!("{}_ptr", elem.codename()),
            Type::Array { elem, len } => format!("{}_arr{}", elem.codename(), len),
            Type::Record(c) => c.codename.clone(),
            Type::Union(c) => c.codename.clone(),
            Type::Enum { codename, .. } => codename.clone(),
            Type::Function { args, rets } => {
                let mut s = String::from("func");
                for a in args {
                    s.push('_');
                    s.push_str(&a.codename());
                }
                s.push_str("_ret");
                for r in rets {
                    s.push('_');
                    s.push_str(&r.codename());
                }
                s
            }
            other => other.name(),
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Type::Int(_)) || matches!(self, Type::Enum { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float { .. })
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integral() || self.is_float()
    }

    pub fn is_signed(&self) -> bool {
        match self {
            Type::Int(k) => k.signed,
            Type::Enum { subtype, .. } => subtype.is_signed(),
            Type::Float { .. } => true,
            _ => false,
        }
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(self, Type::Int(k) if !k.signed)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_) | Type::Nilptr)
    }

    pub fn is_comptime_only(&self) -> bool {
        matches!(self, Type::Niltype | Type::TypeType | Type::Auto)
    }

    /// Bit width of integral and float types
    pub fn bitsize(&self) -> Option<u32> {
        match self {
            Type::Int(k) => Some(k.bits as u32),
            Type::Float { bits } => Some(*bits as u32),
            Type::Enum { subtype, .. } => subtype.bitsize(),
            Type::Boolean => Some(8),
            _ => None,
        }
    }

    /// Smallest representable value of an integral type
    pub fn min_int(&self) -> Option<i128> {
        match self {
            Type::Int(k) => {
                if k.signed {
                    Some(-(1i128 << (k.bits - 1)))
                } else {
                    Some(0)
                }
            }
            Type::Enum { subtype, .. } => subtype.min_int(),
            _ => None,
        }
    }

    /// Largest representable value of an integral type
    pub fn max_int(&self) -> Option<u128> {
        match self {
            Type::Int(k) => {
                if k.signed {
                    Some((1u128 << (k.bits - 1)) - 1)
                } else {
                    Some((1u128 << k.bits) - 1)
                }
            }
            Type::Enum { subtype, .. } => subtype.max_int(),
            _ => None,
        }
    }

    /// Whether a known integer value is representable in this type
    pub fn fits_int(&self, v: i128) -> bool {
        match (self.min_int(), self.max_int()) {
            (Some(min), Some(max)) => v >= min && (v < 0 || (v as u128) <= max),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Compile-time values
// ============================================================================

/// A constant value known during analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Type(TypeRef),
}

impl Value {
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Type(t) => write!(f, "{}", t),
        }
    }
}

// ============================================================================
// Type context
// ============================================================================

/// Owns the deduplicated type set for one translation unit.
///
/// Primitives are built once; derived types go through the interner so
/// structural duplicates share a single `TypeRef`.
pub struct TypeContext {
    pub int8: TypeRef,
    pub int16: TypeRef,
    pub int32: TypeRef,
    pub int64: TypeRef,
    pub uint8: TypeRef,
    pub uint16: TypeRef,
    pub uint32: TypeRef,
    pub uint64: TypeRef,
    pub isize: TypeRef,
    pub usize: TypeRef,
    pub float32: TypeRef,
    pub float64: TypeRef,
    pub float128: TypeRef,
    pub boolean: TypeRef,
    pub stringview: TypeRef,
    pub cstring: TypeRef,
    pub niltype: TypeRef,
    pub nilptr: TypeRef,
    pub void: TypeRef,
    pub pointer: TypeRef,
    pub typetype: TypeRef,
    pub auto: TypeRef,
    interner: RefCell<HashMap<String, TypeRef>>,
    /// Per-name counter so distinct anonymous composites get distinct codenames
    nominal_counter: RefCell<HashMap<String, usize>>,
}

fn int(bits: u8, signed: bool) -> TypeRef {
    Rc::new(Type::Int(IntKind { bits, signed, ptr_sized: false }))
}

impl Default for TypeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeContext {
    pub fn new() -> Self {
        Self {
            int8: int(8, true),
            int16: int(16, true),
            int32: int(32, true),
            int64: int(64, true),
            uint8: int(8, false),
            uint16: int(16, false),
            uint32: int(32, false),
            uint64: int(64, false),
            // 64-bit target assumption for range metadata
            isize: Rc::new(Type::Int(IntKind { bits: 64, signed: true, ptr_sized: true })),
            usize: Rc::new(Type::Int(IntKind { bits: 64, signed: false, ptr_sized: true })),
            float32: Rc::new(Type::Float { bits: 32 }),
            float64: Rc::new(Type::Float { bits: 64 }),
            float128: Rc::new(Type::Float { bits: 128 }),
            boolean: Rc::new(Type::Boolean),
            stringview: Rc::new(Type::StringView),
            cstring: Rc::new(Type::CString),
            niltype: Rc::new(Type::Niltype),
            nilptr: Rc::new(Type::Nilptr),
            void: Rc::new(Type::Void),
            pointer: Rc::new(Type::Pointer(None)),
            typetype: Rc::new(Type::TypeType),
            auto: Rc::new(Type::Auto),
            interner: RefCell::new(HashMap::new()),
            nominal_counter: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve a primitive type by source name, including aliases
    pub fn primitive(&self, name: &str) -> Option<TypeRef> {
        let ty = match name {
            "int8" => &self.int8,
            "int16" => &self.int16,
            "int32" => &self.int32,
            "int64" | "integer" => &self.int64,
            "uint8" | "byte" => &self.uint8,
            "uint16" => &self.uint16,
            "uint32" => &self.uint32,
            "uint64" => &self.uint64,
            "isize" => &self.isize,
            "usize" => &self.usize,
            "float32" => &self.float32,
            "float64" | "number" => &self.float64,
            "float128" => &self.float128,
            "boolean" => &self.boolean,
            "stringview" | "string" => &self.stringview,
            "cstring" => &self.cstring,
            "niltype" => &self.niltype,
            "nilptr" => &self.nilptr,
            "void" => &self.void,
            "pointer" => &self.pointer,
            "type" => &self.typetype,
            "auto" => &self.auto,
            _ => return None,
        };
        Some(ty.clone())
    }

    fn intern(&self, ty: Type) -> TypeRef {
        let key = ty.codename();
        let mut interner = self.interner.borrow_mut();
        if let Some(existing) = interner.get(&key) {
            return existing.clone();
        }
        let ty = Rc::new(ty);
        interner.insert(key, ty.clone());
        ty
    }

    pub fn pointer_to(&self, elem: TypeRef) -> TypeRef {
        self.intern(Type::Pointer(Some(elem)))
    }

    pub fn array_of(&self, elem: TypeRef, len: u64) -> TypeRef {
        self.intern(Type::Array { elem, len })
    }

    pub fn function(&self, args: Vec<TypeRef>, rets: Vec<TypeRef>) -> TypeRef {
        self.intern(Type::Function { args, rets })
    }

    fn fresh_codename(&self, name: &str) -> String {
        let mut counters = self.nominal_counter.borrow_mut();
        let n = counters.entry(name.to_string()).or_insert(0);
        *n += 1;
        if *n == 1 {
            name.to_string()
        } else {
            format!("{}_{}", name, n)
        }
    }

    /// Create a nominal record type with a fresh codename
    pub fn record(&self, name: &str, fields: Vec<Field>) -> TypeRef {
        let codename = self.fresh_codename(name);
        self.intern(Type::Record(Rc::new(Composite {
            name: name.to_string(),
            codename,
            fields,
        })))
    }

    /// Create a nominal union type with a fresh codename
    pub fn union(&self, name: &str, fields: Vec<Field>) -> TypeRef {
        let codename = self.fresh_codename(name);
        self.intern(Type::Union(Rc::new(Composite {
            name: name.to_string(),
            codename,
            fields,
        })))
    }

    /// Create a nominal enum type with a fresh codename
    pub fn enumeration(
        &self,
        name: &str,
        subtype: TypeRef,
        fields: Vec<(String, i128)>,
    ) -> TypeRef {
        let codename = self.fresh_codename(name);
        self.intern(Type::Enum {
            name: name.to_string(),
            codename,
            subtype,
            fields,
        })
    }

    /// Minimum-width inference for an integer literal. Defaults to `int64`
    /// when the value fits; larger positive values land in `uint64`.
    pub fn int_literal_type(&self, v: i128) -> Option<TypeRef> {
        if self.int64.fits_int(v) {
            Some(self.int64.clone())
        } else if self.uint64.fits_int(v) {
            Some(self.uint64.clone())
        } else {
            None
        }
    }

    /// The narrowest integer type holding a known value, preferring signed
    pub fn narrowest_int(&self, v: i128) -> TypeRef {
        for ty in [&self.int8, &self.int16, &self.int32, &self.int64] {
            if ty.fits_int(v) {
                return (*ty).clone();
            }
        }
        self.uint64.clone()
    }

    /// Map an integer type to its same-width signed counterpart
    pub fn signed_type(&self, ty: &Type) -> Option<TypeRef> {
        match ty {
            Type::Int(k) if k.ptr_sized => Some(self.isize.clone()),
            Type::Int(k) => match k.bits {
                8 => Some(self.int8.clone()),
                16 => Some(self.int16.clone()),
                32 => Some(self.int32.clone()),
                64 => Some(self.int64.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Map an integer type to its same-width unsigned counterpart
    pub fn unsigned_type(&self, ty: &Type) -> Option<TypeRef> {
        match ty {
            Type::Int(k) if k.ptr_sized => Some(self.usize.clone()),
            Type::Int(k) => match k.bits {
                8 => Some(self.uint8.clone()),
                16 => Some(self.uint16.clone()),
                32 => Some(self.uint32.clone()),
                64 => Some(self.uint64.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Result type of `a op b` for an arithmetic `op`
    pub fn promote(&self, a: &TypeRef, b: &TypeRef) -> Option<TypeRef> {
        if !a.is_arithmetic() || !b.is_arithmetic() {
            return None;
        }
        if a.is_float() || b.is_float() {
            let bits = a
                .bitsize()
                .unwrap_or(64)
                .max(b.bitsize().unwrap_or(64))
                .max(32);
            return match bits {
                32 => Some(self.float32.clone()),
                64 => Some(self.float64.clone()),
                _ => Some(self.float128.clone()),
            };
        }
        let bits = a.bitsize()?.max(b.bitsize()?) as u8;
        let signed = match (a.is_signed(), b.is_signed()) {
            (true, true) => true,
            (false, false) => false,
            // Mixed signedness promotes to the signed type of the max width
            _ => true,
        };
        let ty = match (bits, signed) {
            (8, true) => self.int8.clone(),
            (16, true) => self.int16.clone(),
            (32, true) => self.int32.clone(),
            (64, true) => self.int64.clone(),
            (8, false) => self.uint8.clone(),
            (16, false) => self.uint16.clone(),
            (32, false) => self.uint32.clone(),
            (64, false) => self.uint64.clone(),
            _ => return None,
        };
        Some(ty)
    }

    /// Can a value of `src` be assigned to `dst`, possibly with implicit
    /// widening? A known constant value enables value-aware narrowing.
    pub fn assignable(&self, dst: &TypeRef, src: &TypeRef, value: Option<&Value>) -> bool {
        if **dst == **src || matches!(**dst, Type::Auto) {
            return true;
        }
        match (&**dst, &**src) {
            (Type::Int(d), Type::Int(s)) => {
                if d.signed == s.signed && d.bits >= s.bits {
                    return true;
                }
                if d.signed && !s.signed && d.bits > s.bits {
                    return true;
                }
                if let Some(Value::Int(v)) = value {
                    return dst.fits_int(*v);
                }
                false
            }
            (Type::Float { bits: d }, Type::Float { bits: s }) => d >= s,
            (Type::Float { .. }, Type::Int(_)) => true,
            (Type::Int(_), Type::Float { .. }) => {
                // Float constants that are exact integers may narrow
                matches!(value, Some(Value::Float(f)) if f.fract() == 0.0 && dst.fits_int(*f as i128))
            }
            (Type::Pointer(_), Type::Nilptr) => true,
            (Type::Pointer(None), Type::Pointer(_)) => true,
            (Type::CString, Type::StringView) => true,
            (Type::StringView, Type::CString) => true,
            (Type::Int(_), Type::Enum { subtype, .. }) => self.assignable(dst, subtype, value),
            (Type::Boolean, _) => matches!(&**src, Type::Boolean | Type::Niltype),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_ranges() {
        let ctx = TypeContext::new();
        assert_eq!(ctx.int8.min_int(), Some(-128));
        assert_eq!(ctx.int8.max_int(), Some(127));
        assert_eq!(ctx.uint8.min_int(), Some(0));
        assert_eq!(ctx.uint8.max_int(), Some(255));
        assert_eq!(ctx.int64.bitsize(), Some(64));
        assert_eq!(ctx.uint64.max_int(), Some(u64::MAX as u128));
    }

    #[test]
    fn test_signed_unsigned_mapping() {
        let ctx = TypeContext::new();
        assert!(Rc::ptr_eq(&ctx.unsigned_type(&ctx.int32).unwrap(), &ctx.uint32));
        assert!(Rc::ptr_eq(&ctx.signed_type(&ctx.uint32).unwrap(), &ctx.int32));
        assert!(Rc::ptr_eq(&ctx.unsigned_type(&ctx.isize).unwrap(), &ctx.usize));
    }

    #[test]
    fn test_interning_dedupes_structural_types() {
        let ctx = TypeContext::new();
        let a = ctx.array_of(ctx.int64.clone(), 4);
        let b = ctx.array_of(ctx.int64.clone(), 4);
        assert!(Rc::ptr_eq(&a, &b));
        let p = ctx.pointer_to(ctx.int64.clone());
        let q = ctx.pointer_to(ctx.int64.clone());
        assert!(Rc::ptr_eq(&p, &q));
    }

    #[test]
    fn test_records_are_nominal() {
        let ctx = TypeContext::new();
        let fields = vec![Field { name: "x".into(), ty: ctx.int64.clone() }];
        let a = ctx.record("P", fields.clone());
        let b = ctx.record("P", fields);
        assert!(!Rc::ptr_eq(&a, &b));
        assert_ne!(a.codename(), b.codename());
    }

    #[test]
    fn test_promotion() {
        let ctx = TypeContext::new();
        let t = ctx.promote(&ctx.int32, &ctx.int64).unwrap();
        assert_eq!(*t, *ctx.int64);
        let t = ctx.promote(&ctx.uint32, &ctx.int8).unwrap();
        assert_eq!(*t, *ctx.int32);
        let t = ctx.promote(&ctx.int64, &ctx.float32).unwrap();
        assert!(t.is_float());
    }

    #[test]
    fn test_value_aware_narrowing() {
        let ctx = TypeContext::new();
        assert!(ctx.assignable(&ctx.int8, &ctx.int64, Some(&Value::Int(100))));
        assert!(!ctx.assignable(&ctx.int8, &ctx.int64, Some(&Value::Int(1000))));
        assert!(!ctx.assignable(&ctx.int8, &ctx.int64, None));
        assert!(ctx.assignable(&ctx.uint8, &ctx.int64, Some(&Value::Int(255))));
        assert!(!ctx.assignable(&ctx.uint8, &ctx.int64, Some(&Value::Int(-1))));
    }

    #[test]
    fn test_literal_width_inference() {
        let ctx = TypeContext::new();
        assert_eq!(*ctx.int_literal_type(1).unwrap(), *ctx.int64);
        assert_eq!(*ctx.int_literal_type(i64::MAX as i128).unwrap(), *ctx.int64);
        assert_eq!(
            *ctx.int_literal_type(i64::MAX as i128 + 1).unwrap(),
            *ctx.uint64
        );
        assert!(ctx.int_literal_type(u64::MAX as i128 + 1).is_none());
        assert_eq!(*ctx.narrowest_int(100), *ctx.int8);
        assert_eq!(*ctx.narrowest_int(1000), *ctx.int16);
    }
}
