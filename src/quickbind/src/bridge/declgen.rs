//! TypeScript declaration emission.
//!
//! The binding commit regenerates `internal/lib/builtins.d.ts` beside the
//! script tree on every run, and writes `internal/lib/core.d.ts` once if it
//! is absent. IO failures are logged and the commit carries on with partial
//! output.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use quickbind_reflect::{
    NativeFunction, Registry, Signature, Symbol, TypeFlags, TypeRef,
};
use tracing::{debug, error};

use crate::bridge;

/// Indentation-aware text builder for generated source files.
pub struct SourceBuilder {
    content: String,
    indent: usize,
    needs_indent: bool,
}

impl Default for SourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceBuilder {
    pub fn new() -> Self {
        Self { content: String::new(), indent: 0, needs_indent: false }
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn unindent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    fn ensure_indent(&mut self) {
        if self.needs_indent {
            for _ in 0..self.indent {
                self.content.push_str("    ");
            }
            self.needs_indent = false;
        }
    }

    pub fn push(&mut self, text: &str) {
        self.ensure_indent();
        self.content.push_str(text);
    }

    pub fn newline(&mut self) {
        self.content.push('\n');
        self.needs_indent = true;
    }

    pub fn line(&mut self, text: &str) {
        self.push(text);
        self.newline();
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.content)
    }
}

/// Script-side name of a type, for signatures and field declarations.
pub fn type_name(ty: &TypeRef) -> String {
    if let Some(name) = bridge::data(ty).ts_name.borrow().as_ref() {
        return name.clone();
    }
    if let Some(pointee) = ty.pointee() {
        return type_name(&pointee);
    }
    if let Some(elem) = ty.array_element() {
        return format!("{}[]", type_name(&elem));
    }
    if let Some(sig) = ty.signature() {
        return arrow_signature(&sig);
    }
    if ty.size() == 0 {
        return String::from("void");
    }
    let flags = ty.flags();
    if flags.contains(TypeFlags::ENUM) || flags.contains(TypeFlags::OPAQUE) {
        return ty.name().to_string();
    }
    if flags.contains(TypeFlags::PRIMITIVE) {
        if ty.name() == "bool" {
            return String::from("boolean");
        }
        return String::from("number");
    }
    ty.name().to_string()
}

fn arrow_signature(sig: &Signature) -> String {
    let mut out = String::from("(");
    for (i, arg) in sig.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let name = if arg.name.is_empty() { format!("arg{i}") } else { arg.name.clone() };
        let _ = write!(out, "{}: {}", name, type_name(&arg.ty));
    }
    let _ = write!(out, ") => {}", type_name(&sig.ret));
    out
}

fn param_name(func: &NativeFunction, index: usize, fallback: &str) -> String {
    let docs = func.docs();
    if let Some(p) = docs.params.iter().find(|p| p.index == index) {
        if !p.name.is_empty() {
            return p.name.clone();
        }
    }
    if fallback.is_empty() { format!("arg{index}") } else { fallback.to_string() }
}

fn emit_function_docs(out: &mut SourceBuilder, func: &NativeFunction) {
    let docs = func.docs();
    if docs.description.is_empty() && docs.params.is_empty() && docs.returns.is_empty() {
        return;
    }
    out.line("/**");
    if !docs.description.is_empty() {
        out.line(&format!(" * {}", docs.description));
    }
    for p in &docs.params {
        out.line(&format!(" * @param {} {}", p.name, p.description));
    }
    if !docs.returns.is_empty() {
        out.line(&format!(" * @returns {}", docs.returns));
    }
    out.line(" */");
}

fn function_signature(func: &Rc<NativeFunction>) -> String {
    let sig = func.signature();
    let mut out = String::from("(");
    for (i, arg) in sig.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}: {}", param_name(func, i, &arg.name), type_name(&arg.ty));
    }
    let ret = type_name(&sig.ret);
    if func.is_async() {
        let _ = write!(out, "): Promise<{ret}>");
    } else {
        let _ = write!(out, "): {ret}");
    }
    out
}

fn emit_function(out: &mut SourceBuilder, func: &Rc<NativeFunction>, export: bool) {
    emit_function_docs(out, func);
    let prefix = if export { "export function" } else { "declare function" };
    out.line(&format!("{prefix} {}{};", func.name(), function_signature(func)));
}

fn emit_data_type(out: &mut SourceBuilder, ty: &TypeRef, export: bool) {
    let prefix = if export { "export" } else { "declare" };
    let name = bridge::script_name(ty);
    let flags = ty.flags();

    if let Some(docs) = bridge::data(ty).docs.borrow().as_ref() {
        if !docs.description.is_empty() {
            out.line(&format!("/** {} */", docs.description));
        }
    }

    if flags.contains(TypeFlags::ENUM) {
        out.line(&format!("{prefix} enum {name} {{"));
        out.indent();
        for field in ty.enum_fields().iter() {
            out.line(&format!("{} = {},", field.name, field.value));
        }
        out.unindent();
        out.line("}");
        return;
    }

    if flags.contains(TypeFlags::OPAQUE) {
        // A branded number: assignable from the API, not from literals.
        out.line(&format!(
            "{prefix} type {name} = number & {{ readonly __brand: \"{name}\" }};"
        ));
        return;
    }

    if ty.is_trivially_constructible() {
        out.line(&format!("{prefix} type {name} = {{"));
        out.indent();
        for prop in ty.props() {
            if prop.offset.is_some() {
                out.line(&format!("{}: {};", prop.name, type_name(&prop.ty)));
            }
        }
        out.unindent();
        out.line("};");
        return;
    }

    // Non-trivial class.
    let extends = ty
        .bases()
        .first()
        .map(|b| format!(" extends {}", bridge::script_name(&b.ty)))
        .unwrap_or_default();
    out.line(&format!("{prefix} class {name}{extends} {{"));
    out.indent();

    for ctor in ty.constructors() {
        let sig = ctor.signature();
        // The canonical copy constructor is a host-side affair.
        if sig.args.len() == 1
            && sig.args[0].ty.is_pointer()
            && sig.args[0].ty.pointee().is_some_and(|p| quickbind_reflect::same_type(&p, ty))
        {
            continue;
        }
        let mut params = String::new();
        for (i, arg) in sig.args.iter().enumerate() {
            if i > 0 {
                params.push_str(", ");
            }
            let _ = write!(params, "{}: {}", param_name(&ctor, i, &arg.name), type_name(&arg.ty));
        }
        out.line(&format!("constructor({params});"));
    }

    for prop in ty.props() {
        if prop.offset.is_some() {
            let readonly = if prop.writable() { "" } else { "readonly " };
            out.line(&format!("{readonly}{}: {};", prop.name, type_name(&prop.ty)));
        } else if prop.is_method() {
            let Some(func) = &prop.func else { continue };
            emit_function_docs(out, func);
            let stat = if prop.flags.contains(quickbind_reflect::PropFlags::STATIC) {
                "static "
            } else {
                ""
            };
            out.line(&format!("{stat}{}{};", prop.name, function_signature(func)));
        } else if prop.flags.contains(quickbind_reflect::PropFlags::STATIC) {
            let readonly = if prop.writable() { "" } else { "readonly " };
            out.line(&format!("static {readonly}{}: {};", prop.name, type_name(&prop.ty)));
        }
    }

    out.line("destroy(): void;");
    out.unindent();
    out.line("}");
}

/// Collects the data-type names a signature mentions, to derive imports.
fn referenced_types(sig: &Signature, into: &mut Vec<TypeRef>) {
    fn visit(ty: &TypeRef, into: &mut Vec<TypeRef>) {
        if let Some(p) = ty.pointee() {
            visit(&p, into);
        } else if let Some(e) = ty.array_element() {
            visit(&e, into);
        } else if let Some(s) = ty.signature() {
            referenced_types(&s, into);
        } else if !ty.is_primitive() || ty.is_enum() || ty.flags().contains(TypeFlags::OPAQUE) {
            into.push(ty.clone());
        }
    }
    visit(&sig.ret, into);
    for arg in &sig.args {
        visit(&arg.ty, into);
    }
}

fn emit_namespace(
    out: &mut SourceBuilder,
    ns: &quickbind_reflect::Namespace,
    owners: &HashMap<String, String>,
) {
    out.line(&format!("declare module \"{}\" {{", ns.name()));
    out.indent();

    // Types declared elsewhere but referenced here import from their
    // owning module.
    let mut referenced = Vec::new();
    for symbol in ns.symbols() {
        if let Symbol::Function(func) = symbol {
            referenced_types(&func.signature(), &mut referenced);
        }
    }
    let mut imported = Vec::new();
    for ty in referenced {
        let name = bridge::script_name(&ty);
        match owners.get(ty.name()) {
            Some(owner) if owner != ns.name() && !imported.contains(&name) => {
                out.line(&format!("import {{ {name} }} from \"{owner}\";"));
                imported.push(name);
            }
            _ => {}
        }
    }
    if !imported.is_empty() {
        out.newline();
    }

    for symbol in ns.symbols() {
        match symbol {
            Symbol::Function(func) => emit_function(out, &func, true),
            Symbol::Type(ty) => emit_data_type(out, &ty, true),
            Symbol::Value(value) => {
                out.line(&format!("export const {}: {};", value.name, type_name(&value.ty)));
            }
            Symbol::Namespace(_) => {}
        }
    }

    out.unindent();
    out.line("}");
    out.newline();
}

const CORE_DECLARATIONS: &str = include_str!("core.d.ts.in");

/// Emits `builtins.d.ts` (always) and `core.d.ts` (once) into
/// `<script_root>/internal/lib/`.
pub fn emit(registry: &Registry, script_root: &Path) {
    let lib_dir = script_root.join("internal").join("lib");

    let mut owners: HashMap<String, String> = HashMap::new();
    for symbol in registry.global_symbols() {
        if let Symbol::Namespace(ns) = symbol {
            for inner in ns.symbols() {
                if let Symbol::Type(ty) = inner {
                    owners.insert(ty.name().to_string(), ns.name().to_string());
                }
            }
        }
    }

    let mut dts = SourceBuilder::new();
    dts.line("// Generated by the binding commit. Do not edit.");
    dts.newline();

    for symbol in registry.global_symbols() {
        match symbol {
            Symbol::Namespace(ns) => emit_namespace(&mut dts, &ns, &owners),
            Symbol::Function(func) => emit_function(&mut dts, &func, false),
            Symbol::Type(ty) => emit_data_type(&mut dts, &ty, false),
            Symbol::Value(value) => {
                dts.line(&format!("declare const {}: {};", value.name, type_name(&value.ty)));
            }
        }
    }

    let builtins_path = lib_dir.join("builtins.d.ts");
    match dts.write_to_file(&builtins_path) {
        Ok(()) => debug!(path = %builtins_path.display(), "wrote binding declarations"),
        Err(err) => error!(%err, path = %builtins_path.display(), "failed to write declarations"),
    }

    let core_path = lib_dir.join("core.d.ts");
    if !core_path.exists() {
        if let Err(err) = fs::write(&core_path, CORE_DECLARATIONS) {
            error!(%err, path = %core_path.display(), "failed to write core declarations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_tracks_indentation() {
        let mut b = SourceBuilder::new();
        b.line("a {");
        b.indent();
        b.line("b;");
        b.unindent();
        b.line("}");
        assert_eq!(b.content(), "a {\n    b;\n}\n");
    }
}
