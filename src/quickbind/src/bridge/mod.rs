//! The binding bridge: everything between the reflection registry and the
//! script engine.

pub mod call_context;
pub mod callbacks;
pub mod commit;
pub mod declgen;
pub mod host_objects;
pub mod marshal;
pub mod prototype;
pub mod proxies;

use std::cell::RefCell;
use std::rc::Rc;

use quickbind_reflect::{Registry, TypeRef};
use rquickjs::{Ctx, Exception, Object, Persistent, Value};

use crate::bridge::host_objects::HostObjectManager;
use crate::bridge::marshal::Marshal;
use crate::docs::TypeDocs;

/// Script-side artifacts of a bound class, kept alive across calls.
pub struct ScriptClass {
    pub constructor: Persistent<Value<'static>>,
    pub prototype: Persistent<Object<'static>>,
}

/// Bridge-owned data hung off a type descriptor's user-data slot. Created on
/// first access, lives as long as the descriptor.
#[derive(Default)]
pub struct BridgeData {
    /// The marshaller responsible for this type.
    pub marshaller: RefCell<Option<Rc<dyn Marshal>>>,
    /// The host object manager, for non-trivial classes only.
    pub manager: RefCell<Option<Rc<HostObjectManager>>>,
    /// Constructor and prototype, for non-trivial classes only.
    pub class: RefCell<Option<ScriptClass>>,
    /// Script-side type name override (e.g. the host string type is a plain
    /// `string` in declarations).
    pub ts_name: RefCell<Option<String>>,
    /// Documentation attached to the type.
    pub docs: RefCell<Option<TypeDocs>>,
}

impl BridgeData {
    /// Restores the prototype object for this type in the given context.
    pub fn prototype<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Option<Object<'js>>> {
        match self.class.borrow().as_ref() {
            None => Ok(None),
            Some(class) => Ok(Some(class.prototype.clone().restore(ctx)?)),
        }
    }

    /// Restores the constructor value for this type in the given context.
    pub fn constructor<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Option<Value<'js>>> {
        match self.class.borrow().as_ref() {
            None => Ok(None),
            Some(class) => Ok(Some(class.constructor.clone().restore(ctx)?)),
        }
    }
}

/// The bridge data of a type, created on first access.
pub fn data(ty: &TypeRef) -> Rc<BridgeData> {
    if let Some(existing) = ty.user_data::<BridgeData>() {
        return existing;
    }
    let fresh: Rc<BridgeData> = Rc::new(BridgeData::default());
    ty.set_user_data(fresh.clone());
    fresh
}

/// The marshaller of a type; a missing one is an internal error (binding was
/// never committed, or the type was registered after commit).
pub fn marshaller<'js>(ctx: &Ctx<'js>, ty: &TypeRef) -> rquickjs::Result<Rc<dyn Marshal>> {
    match data(ty).marshaller.borrow().as_ref() {
        Some(m) => Ok(m.clone()),
        None => Err(Exception::throw_internal(
            ctx,
            &format!("no marshaller installed for type '{}'", ty.name()),
        )),
    }
}

/// The host object manager of a type, if it is a managed class.
pub fn manager_of(ty: &TypeRef) -> Option<Rc<HostObjectManager>> {
    data(ty).manager.borrow().clone()
}

/// The script-facing name of a type, for errors and declarations.
pub fn script_name(ty: &TypeRef) -> String {
    if let Some(name) = data(ty).ts_name.borrow().as_ref() {
        return name.clone();
    }
    ty.name().to_string()
}

/// Drops every engine handle the bridge holds for the registry's types.
/// Must run before the engine context is torn down: persistent references
/// that outlive the runtime abort on drop.
pub fn release_script_state(registry: &Registry) {
    for ty in registry.types() {
        let data = data(&ty);
        data.class.borrow_mut().take();
        data.manager.borrow_mut().take();
        data.marshaller.borrow_mut().take();
    }
}
