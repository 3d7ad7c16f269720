//! Procedural macros for the fnhost function host.
//!
//! `#[export]` classifies a user function by its declared parameter count and
//! generates a companion type that builds the matching `Handler`.
//!
//! # Example
//!
//! ```ignore
//! use fnhost::prelude::*;
//!
//! #[export(name = "main")]
//! async fn greet(event: Event) -> FunctionResult {
//!     Ok(Some(Reply::ok(format!("hello {}", event.path))))
//! }
//!
//! let module = Module::new().export(GreetExport::NAME, GreetExport::handler());
//! ```

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, punctuated::Punctuated, Expr, ExprLit, ItemFn, Lit, Meta, Token};

#[derive(Default, Debug)]
struct ExportAttrs {
    /// Export name; defaults to the function name.
    name: Option<String>,
    /// Explicit protocol. Only `session` changes the classification.
    protocol: Option<String>,
}

impl ExportAttrs {
    fn parse_meta_list(metas: Punctuated<Meta, Token![,]>) -> syn::Result<Self> {
        let mut attrs = ExportAttrs::default();

        for meta in metas {
            let nv = match meta {
                Meta::NameValue(nv) => nv,
                other => {
                    return Err(syn::Error::new_spanned(other, "expected name = value"));
                }
            };
            let ident = nv
                .path
                .get_ident()
                .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected identifier"))?
                .to_string();
            let value = match &nv.value {
                Expr::Lit(ExprLit {
                    lit: Lit::Str(lit_str),
                    ..
                }) => lit_str.value(),
                _ => return Err(syn::Error::new_spanned(&nv.value, "expected string literal")),
            };

            match ident.as_str() {
                "name" => attrs.name = Some(value),
                "protocol" => attrs.protocol = Some(value),
                _ => {
                    return Err(syn::Error::new_spanned(
                        nv.path,
                        format!("unknown attribute: {}", ident),
                    ));
                }
            }
        }

        Ok(attrs)
    }
}

/// Mark a function as a module export.
///
/// Classification by parameter count:
///
/// - 0: `async fn() -> FunctionResult`
/// - 1: `async fn(Event) -> FunctionResult`
/// - 2: `async fn(Event, FunctionContext) -> FunctionResult`
/// - 3: `fn(Event, FunctionContext, Callback) -> Result<Returned, FunctionError>`,
///   or an `async fn` with the same parameters resolving to
///   `Result<Option<Value>, FunctionError>`
///
/// `protocol = "session"` selects the realtime form
/// `async fn(Session, FunctionContext) -> Result<(), FunctionError>`.
#[proc_macro_attribute]
pub fn export(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    match generate_export(args, input_fn) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn generate_export(
    args: Punctuated<Meta, Token![,]>,
    input_fn: ItemFn,
) -> syn::Result<proc_macro2::TokenStream> {
    let attrs = ExportAttrs::parse_meta_list(args)?;

    let fn_name = &input_fn.sig.ident;
    let fn_vis = &input_fn.vis;
    let is_async = input_fn.sig.asyncness.is_some();
    let arity = input_fn.sig.inputs.len();
    let export_name = attrs.name.unwrap_or_else(|| fn_name.to_string());
    let struct_name = format_ident!("{}Export", to_pascal_case(&fn_name.to_string()));

    let session = match attrs.protocol.as_deref() {
        None => false,
        Some("session") => true,
        Some(other) => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("unknown protocol '{}': only \"session\" can be forced", other),
            ));
        }
    };

    if !is_async && (session || arity < 3) {
        return Err(syn::Error::new_spanned(
            &input_fn.sig,
            "only callback-style exports (event, context, callback) may be synchronous",
        ));
    }

    let (protocol, handler) = if session {
        if arity != 2 {
            return Err(syn::Error::new_spanned(
                &input_fn.sig.inputs,
                "session exports take (session, context)",
            ));
        }
        (
            quote!(Session),
            quote!(::fnhost::function::Handler::session(#fn_name)),
        )
    } else {
        match arity {
            0 => (
                quote!(Nullary),
                quote!(::fnhost::function::Handler::nullary(#fn_name)),
            ),
            1 => (
                quote!(EventOnly),
                quote!(::fnhost::function::Handler::event(#fn_name)),
            ),
            2 => (
                quote!(EventContext),
                quote!(::fnhost::function::Handler::event_context(#fn_name)),
            ),
            3 if is_async => (
                quote!(CallbackStyle),
                quote!(::fnhost::function::Handler::callback(
                    |event, context, callback| {
                        ::std::result::Result::Ok(::fnhost::function::Returned::pending(
                            #fn_name(event, context, callback),
                        ))
                    }
                )),
            ),
            3 => (
                quote!(CallbackStyle),
                quote!(::fnhost::function::Handler::callback(#fn_name)),
            ),
            _ => {
                return Err(syn::Error::new_spanned(
                    &input_fn.sig.inputs,
                    "callback-style exports take (event, context, callback)",
                ));
            }
        }
    };

    Ok(quote! {
        #input_fn

        /// Generated export descriptor.
        #[allow(dead_code)]
        #fn_vis struct #struct_name;

        #[allow(dead_code)]
        impl #struct_name {
            /// Name the function is exported under.
            pub const NAME: &'static str = #export_name;

            /// Calling convention chosen from the declared parameters.
            pub const PROTOCOL: ::fnhost::function::Protocol =
                ::fnhost::function::Protocol::#protocol;

            /// Build the handler for this export.
            pub fn handler() -> ::fnhost::function::Handler {
                #handler
            }
        }
    })
}

/// Convert a snake_case string to PascalCase.
fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().chain(chars).collect(),
            }
        })
        .collect()
}
