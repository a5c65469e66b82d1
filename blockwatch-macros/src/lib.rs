/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Procedural macros for blockwatch
//!
//! `#[frame]` records a function as a call-chain frame of the in-process
//! host, so hooks registered for it apply to every call made beneath it.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse_macro_input, punctuated::Punctuated, Error, Expr, ItemFn, Lit, LitStr, Meta,
    MetaNameValue, Result, Token,
};

/// Configuration for the frame macro
#[derive(Debug, Clone, Default)]
struct FrameConfig {
    /// Declaring type, defaults to the module path
    ty: Option<LitStr>,
    /// Member name, defaults to the function name
    name: Option<LitStr>,
    /// Force a per-type member even with a receiver
    per_type: bool,
    /// Propagate breakpoint violations with `?`
    checked: bool,
}

fn string_value(value: &Expr, key: &str) -> Result<LitStr> {
    match value {
        Expr::Lit(expr_lit) => {
            if let Lit::Str(lit) = &expr_lit.lit {
                if lit.value().is_empty() {
                    return Err(Error::new_spanned(lit, format!("`{key}` must not be empty")));
                }
                Ok(lit.clone())
            } else {
                Err(Error::new_spanned(expr_lit, format!("`{key}` must be a string")))
            }
        }
        _ => Err(Error::new_spanned(
            value,
            format!("`{key}` value must be a string literal"),
        )),
    }
}

impl FrameConfig {
    /// Parse configuration from comma-separated meta items
    fn from_meta_list(meta_list: &Punctuated<Meta, Token![,]>) -> Result<Self> {
        let mut config = Self::default();

        for meta in meta_list {
            match meta {
                Meta::NameValue(MetaNameValue { path, value, .. }) if path.is_ident("ty") => {
                    config.ty = Some(string_value(value, "ty")?);
                }
                Meta::NameValue(MetaNameValue { path, value, .. }) if path.is_ident("name") => {
                    config.name = Some(string_value(value, "name")?);
                }
                Meta::Path(path) if path.is_ident("per_type") => config.per_type = true,
                Meta::Path(path) if path.is_ident("checked") => config.checked = true,
                _ => {
                    return Err(Error::new_spanned(
                        meta,
                        "Invalid argument. Supported: ty, name, per_type, checked",
                    ));
                }
            }
        }

        Ok(config)
    }
}

/// Records the function as a frame of the in-process host.
///
/// # Arguments
///
/// * `ty = "..."` - Declaring type (default: `module_path!()`)
/// * `name = "..."` - Member name (default: the function name)
/// * `per_type` - Render as a per-type member even with a receiver
/// * `checked` - Propagate breakpoint violations with `?`; the function must
///   return a `Result` whose error converts from `BlockingOperationError`.
///   Without it a violation panics.
///
/// Async functions are rejected: a frame guard cannot be held across
/// suspension points. Wrap the future with `blockwatch::host::local::instrument`.
///
/// # Examples
///
/// ```rust,ignore
/// #[blockwatch::frame(ty = "app::Cache")]
/// fn refresh(&self) {
///     // blocking calls here are excused by
///     // allow_blocking_calls_inside("app::Cache", "refresh")
/// }
///
/// #[blockwatch::frame(checked)]
/// fn load(path: &Path) -> std::io::Result<Vec<u8>> {
///     std::fs::read(path)
/// }
/// ```
#[proc_macro_attribute]
pub fn frame(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    match expand_frame(&args, input_fn) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Main expansion logic for the frame macro
fn expand_frame(args: &Punctuated<Meta, Token![,]>, mut input_fn: ItemFn) -> Result<TokenStream2> {
    if let Some(asyncness) = &input_fn.sig.asyncness {
        return Err(Error::new_spanned(
            asyncness,
            "#[frame] cannot be applied to async functions; wrap the future with LocalRuntime::instrument",
        ));
    }
    if let Some(constness) = &input_fn.sig.constness {
        return Err(Error::new_spanned(
            constness,
            "#[frame] cannot be applied to const functions",
        ));
    }

    let config = FrameConfig::from_meta_list(args)?;

    let ty = match &config.ty {
        Some(ty) => quote! { #ty },
        None => quote! { ::core::module_path!() },
    };
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| LitStr::new(&input_fn.sig.ident.to_string(), input_fn.sig.ident.span()));

    let constructor = if config.per_type || input_fn.sig.receiver().is_none() {
        quote! { per_type }
    } else {
        quote! { instance }
    };

    let enter = if config.checked {
        quote! { ::blockwatch::host::local::try_enter_frame(&__BLOCKWATCH_FRAME)? }
    } else {
        quote! { ::blockwatch::host::local::enter_frame(&__BLOCKWATCH_FRAME) }
    };

    let stmts = &input_fn.block.stmts;
    let body = quote! {
        {
            const __BLOCKWATCH_FRAME: ::blockwatch::MemberRef =
                ::blockwatch::MemberRef::#constructor(#ty, #name);
            let __blockwatch_frame = #enter;
            #(#stmts)*
        }
    };
    *input_fn.block = syn::parse2(body)?;

    Ok(quote! { #input_fn })
}
