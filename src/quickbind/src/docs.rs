//! Documentation attached to bound data types. Function documentation lives
//! with the registry ([`quickbind_reflect::FunctionDocs`]); this covers the
//! type-level records the declaration emitter consumes.

use quickbind_reflect::TypeRef;

use crate::bridge;

#[derive(Default, Clone)]
pub struct TypeDocs {
    pub description: String,
    pub properties: Vec<PropertyDocs>,
}

#[derive(Clone)]
pub struct PropertyDocs {
    pub name: String,
    pub description: String,
}

impl TypeDocs {
    pub fn property(&self, name: &str) -> Option<&PropertyDocs> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Fluent builder mirroring the function-side `describe`.
pub struct TypeDocsBuilder {
    ty: TypeRef,
}

pub fn describe_type(ty: &TypeRef) -> TypeDocsBuilder {
    TypeDocsBuilder { ty: ty.clone() }
}

impl TypeDocsBuilder {
    fn update(self, f: impl FnOnce(&mut TypeDocs)) -> Self {
        let data = bridge::data(&self.ty);
        let mut docs = data.docs.borrow_mut();
        f(docs.get_or_insert_with(TypeDocs::default));
        self
    }

    pub fn desc(self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.update(|d| d.description = description)
    }

    pub fn property(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let description = description.into();
        self.update(|d| d.properties.push(PropertyDocs { name, description }))
    }
}
