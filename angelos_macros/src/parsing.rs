//! Attribute parsing and signature analysis for `#[task]`.

use syn::{GenericArgument, PathArguments, ReturnType, Type};

/// Arguments for the #[task] attribute macro
#[derive(Default)]
pub(crate) struct TaskArgs {
    /// Registry key; defaults to the function name
    pub name: Option<String>,
    /// Safe to run again after a lost worker
    pub idempotent: bool,
}

impl TaskArgs {
    /// Parse a single attribute using ParseNestedMeta
    pub fn parse_meta(&mut self, meta: syn::meta::ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("name") {
            let name: syn::LitStr = meta.value()?.parse()?;
            if name.value().is_empty() {
                return Err(syn::Error::new_spanned(name, "task name must not be empty"));
            }
            self.name = Some(name.value());
            Ok(())
        } else if meta.path.is_ident("idempotent") {
            self.idempotent = true;
            Ok(())
        } else {
            Err(meta.error("expected `name` or `idempotent`"))
        }
    }
}

/// Returns `T` from a `Result<T, E>` return type.
pub(crate) fn result_ok_type(return_type: &ReturnType) -> Option<&Type> {
    match return_type {
        ReturnType::Default => None,
        ReturnType::Type(_, ty) => result_ok_type_inner(ty),
    }
}

fn result_ok_type_inner(ty: &Type) -> Option<&Type> {
    match ty {
        Type::Path(type_path) => {
            // Match both "Result" and full path like "std::result::Result"
            let segment = type_path.path.segments.last()?;
            if segment.ident != "Result" {
                return None;
            }
            let PathArguments::AngleBracketed(args) = &segment.arguments else {
                return None;
            };
            match args.args.first()? {
                GenericArgument::Type(ok) => Some(ok),
                _ => None,
            }
        }
        Type::Paren(paren) => result_ok_type_inner(&paren.elem),
        Type::Group(group) => result_ok_type_inner(&group.elem),
        _ => None,
    }
}
