//! Type system
//!
//! Immutable descriptors for primitive, class and array types. Every distinct
//! type is created once and cached by the [`TypeProvider`]; everything else in
//! the engine refers to types through the compact [`TypeId`], which is also the
//! value stored in each heap object's header.

mod class;
mod provider;

pub use class::{AccessModifier, ClassMetadata, Field, FieldDef};
pub use provider::{TypeProvider, UNRESOLVED_NAME};

use once_cell::unsync::OnceCell;
use std::fmt;
use std::num::NonZeroU32;

/// Size in bytes of a reference at rest (fields, array elements)
pub const REFERENCE_SIZE: usize = 8;

/// Identifier of a type owned by a [`TypeProvider`]
///
/// Ids start at 1; the value 0 never names a type, which lets a zeroed header
/// field mark a tombstoned heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(NonZeroU32);

impl TypeId {
    pub(crate) fn from_index(index: usize) -> Self {
        // index + 1 is never zero
        TypeId(NonZeroU32::MIN.saturating_add(index as u32))
    }

    /// Position in the provider's table
    #[inline]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw value, as written into object headers and machine code
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0.get()
    }

    /// Rebuild from a raw header/machine-code value
    #[inline]
    pub fn from_u32(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(TypeId)
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// Built-in value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Int,
    Float,
    Void,
    Bool,
}

impl PrimitiveType {
    /// Natural width in bytes
    pub fn size_of(self) -> usize {
        match self {
            PrimitiveType::Int | PrimitiveType::Float => 4,
            PrimitiveType::Bool => 1,
            PrimitiveType::Void => 0,
        }
    }

    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Int => "Int",
            PrimitiveType::Float => "Float",
            PrimitiveType::Void => "Void",
            PrimitiveType::Bool => "Bool",
        }
    }
}

/// A class type; its layout is attached once and frozen afterwards
#[derive(Debug)]
pub struct ClassType {
    name: String,
    metadata: OnceCell<ClassMetadata>,
}

impl ClassType {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            metadata: OnceCell::new(),
        }
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field layout, once defined
    pub fn metadata(&self) -> Option<&ClassMetadata> {
        self.metadata.get()
    }

    /// Whether the field layout has been defined
    pub fn is_defined(&self) -> bool {
        self.metadata.get().is_some()
    }
}

/// An array type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayType {
    element: TypeId,
}

impl ArrayType {
    /// Element type
    pub fn element(&self) -> TypeId {
        self.element
    }
}

/// A type descriptor
#[derive(Debug)]
pub enum BaseType {
    Primitive(PrimitiveType),
    Class(ClassType),
    Array(ArrayType),
}

impl BaseType {
    /// Reference types are stored as one machine word and traced by the GC
    pub fn is_reference(&self) -> bool {
        matches!(self, BaseType::Class(_) | BaseType::Array(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, BaseType::Array(_))
    }

    pub fn is_class(&self) -> bool {
        matches!(self, BaseType::Class(_))
    }

    /// Size of a value of this type at rest
    pub fn size_of(&self) -> usize {
        match self {
            BaseType::Primitive(primitive) => primitive.size_of(),
            BaseType::Class(_) | BaseType::Array(_) => REFERENCE_SIZE,
        }
    }

    pub fn as_primitive(&self) -> Option<PrimitiveType> {
        match self {
            BaseType::Primitive(primitive) => Some(*primitive),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassType> {
        match self {
            BaseType::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match self {
            BaseType::Array(array) => Some(array),
            _ => None,
        }
    }
}

/// Errors raised while declaring or laying out types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("type '{0}' is already declared")]
    DuplicateType(String),
    #[error("type '{0}' is not a class")]
    NotAClass(String),
    #[error("class '{0}' already has a field layout")]
    ClassAlreadyDefined(String),
    #[error("field '{class}.{field}' cannot have type Void")]
    VoidField { class: String, field: String },
    #[error("field '{class}.{field}' is declared twice")]
    DuplicateField { class: String, field: String },
    #[error("arrays of Void are not allowed")]
    VoidArrayElement,
    #[error("type id #{0} was not issued by this provider")]
    UnknownType(u32),
}
