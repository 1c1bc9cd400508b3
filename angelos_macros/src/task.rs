//! Expansion of `#[task]`.
//!
//! The annotated function is consumed: its name becomes a unit struct and
//! its body becomes the struct's `Task::run`.

use crate::parsing::{result_ok_type, TaskArgs};
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, FnArg, ItemFn};

pub(crate) fn task_impl(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TaskArgs::default();
    let parser = syn::meta::parser(|meta| args.parse_meta(meta));
    parse_macro_input!(attr with parser);

    let input = parse_macro_input!(item as ItemFn);

    match expand(args, input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(args: TaskArgs, input: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "#[task] can only be applied to async functions",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "#[task] functions cannot be generic",
        ));
    }
    if let Some(extra) = sig.inputs.iter().nth(1) {
        return Err(syn::Error::new_spanned(
            extra,
            "#[task] functions take at most one argument (use a struct for several values)",
        ));
    }

    let not_result =
        || syn::Error::new_spanned(&sig.output, "#[task] functions must return Result<T, E>");
    let syn::ReturnType::Type(_, return_type) = &sig.output else {
        return Err(not_result());
    };
    let ok_type = result_ok_type(&sig.output).ok_or_else(not_result)?;

    let (arg_pat, arg_type) = match sig.inputs.first() {
        None => (quote! { _args }, quote! { ::angelos::NoArgs }),
        Some(FnArg::Typed(pat_type)) => {
            let pat = &pat_type.pat;
            let ty = &pat_type.ty;
            (quote! { #pat }, quote! { #ty })
        }
        Some(FnArg::Receiver(receiver)) => {
            return Err(syn::Error::new_spanned(
                receiver,
                "#[task] functions cannot take self",
            ));
        }
    };

    let ident = &sig.ident;
    let name = args.name.unwrap_or_else(|| ident.to_string());
    let idempotent = args.idempotent;

    Ok(quote! {
        #(#attrs)*
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, Default)]
        #vis struct #ident;

        impl ::angelos::Task for #ident {
            const NAME: &'static str = #name;
            const IDEMPOTENT: bool = #idempotent;
            type Args = #arg_type;
            type Output = #ok_type;

            async fn run(
                &self,
                #arg_pat: Self::Args,
            ) -> ::core::result::Result<Self::Output, ::angelos::BoxError> {
                let result: #return_type = async move #block.await;
                result.map_err(::core::convert::Into::into)
            }
        }
    })
}
