//! Class metadata and field layout

use super::{TypeError, TypeId};
use rustc_hash::FxHashMap;

/// Field visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessModifier {
    #[default]
    Public,
    Private,
}

/// A field as declared by the loader, before layout
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeId,
    pub access: AccessModifier,
}

impl FieldDef {
    /// Public field
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
            access: AccessModifier::Public,
        }
    }

    /// Field with an explicit access modifier
    pub fn with_access(name: impl Into<String>, ty: TypeId, access: AccessModifier) -> Self {
        Self {
            name: name.into(),
            ty,
            access,
        }
    }
}

/// A laid-out field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    ty: TypeId,
    access: AccessModifier,
    layout_offset: u32,
    size: u32,
    reference: bool,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn access(&self) -> AccessModifier {
        self.access
    }

    /// Byte offset from the start of the object data
    pub fn layout_offset(&self) -> u32 {
        self.layout_offset
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the field holds a reference the GC must trace
    pub fn is_reference(&self) -> bool {
        self.reference
    }
}

/// Ordered, frozen field layout of a class
///
/// Offsets are assigned in declaration order as the running sum of the
/// preceding field sizes. No reordering, no padding.
#[derive(Debug, Clone)]
pub struct ClassMetadata {
    fields: Vec<Field>,
    by_name: FxHashMap<String, usize>,
    size: u32,
}

impl ClassMetadata {
    pub(crate) fn layout(
        class_name: &str,
        defs: Vec<FieldDef>,
        describe: impl Fn(TypeId) -> (usize, bool),
    ) -> Result<Self, TypeError> {
        let mut fields = Vec::with_capacity(defs.len());
        let mut by_name = FxHashMap::default();
        let mut offset = 0u32;

        for def in defs {
            let (size, reference) = describe(def.ty);
            if size == 0 {
                return Err(TypeError::VoidField {
                    class: class_name.to_string(),
                    field: def.name,
                });
            }
            if by_name.contains_key(&def.name) {
                return Err(TypeError::DuplicateField {
                    class: class_name.to_string(),
                    field: def.name,
                });
            }
            by_name.insert(def.name.clone(), fields.len());
            fields.push(Field {
                name: def.name,
                ty: def.ty,
                access: def.access,
                layout_offset: offset,
                size: size as u32,
                reference,
            });
            offset += size as u32;
        }

        Ok(Self {
            fields,
            by_name,
            size: offset,
        })
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&index| &self.fields[index])
    }

    /// Index of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Sum of all field sizes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Fields the GC traces
    pub fn reference_fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter().filter(|field| field.reference)
    }
}
