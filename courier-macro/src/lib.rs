/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![forbid(unsafe_code)]

//! Courier Macro Library
//!
//! Procedural macros for declaring message types that travel through the
//! Courier gateway.
//!
//! # Message Macro
//!
//! The [`courier_message`] macro turns a plain struct into a schema-contracted
//! message: it adds the serde derives, binds the struct to a type tag, and
//! records the schema version receivers must agree on.
//!
//! ```ignore
//! #[courier_message("commands.CreateBatch")]
//! pub struct CreateBatch {
//!     pub uuid: String,
//! }
//!
//! #[courier_message("queries.BatchesRequest", version = 2)]
//! pub struct BatchesRequest {}
//! ```

use proc_macro::TokenStream;

use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, DeriveInput, LitInt, LitStr, Token};

fn has_derive(input: &DeriveInput, trait_name: &str) -> bool {
    input.attrs.iter().any(|attr| {
        if attr.path().is_ident("derive") {
            let mut found = false;
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident(trait_name)
                    || meta
                        .path
                        .segments
                        .last()
                        .is_some_and(|segment| segment.ident == trait_name)
                {
                    found = true;
                }
                Ok(())
            });
            found
        } else {
            false
        }
    })
}

/// Arguments parsed from `#[courier_message("type.Tag", version = N)]`.
struct MessageArgs {
    /// The wire type tag.
    type_tag: LitStr,
    /// Schema version, `1` unless given.
    version: u16,
}

impl Parse for MessageArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let type_tag: LitStr = input.parse()?;
        if type_tag.value().trim().is_empty() {
            return Err(syn::Error::new(type_tag.span(), "the type tag must not be empty"));
        }

        let mut version = 1u16;
        while input.peek(Token![,]) {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let key: syn::Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            if key == "version" {
                let literal: LitInt = input.parse()?;
                version = literal.base10_parse()?;
                if version == 0 {
                    return Err(syn::Error::new(literal.span(), "schema versions start at 1"));
                }
            } else {
                return Err(syn::Error::new(
                    key.span(),
                    format!("unknown courier_message option `{key}`"),
                ));
            }
        }

        Ok(Self { type_tag, version })
    }
}

/// Declares a schema-contracted gateway message.
///
/// The first argument is the type tag carried in every envelope. An optional
/// `version = N` sets the schema version (default `1`); a receiver whose
/// registry knows a different version rejects the payload.
///
/// This expands to:
/// - `#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]` for
///   whichever of those are not already derived
/// - an implementation of `courier::Message`
/// - a compile-time assertion that the type is `Send + Sync + 'static`
///
/// **Note:** the serde derives require `serde` to be a dependency of the
/// crate using the macro.
#[proc_macro_attribute]
pub fn courier_message(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as MessageArgs);
    let input = parse_macro_input!(item as DeriveInput);

    if !input.generics.params.is_empty() {
        return syn::Error::new_spanned(
            &input.generics,
            "courier messages cannot be generic; each type tag names exactly one shape",
        )
        .to_compile_error()
        .into();
    }

    let name = &input.ident;
    let type_tag = &args.type_tag;
    let version = args.version;

    let derives = {
        let mut traits = Vec::new();
        if !has_derive(&input, "Clone") {
            traits.push(quote!(Clone));
        }
        if !has_derive(&input, "Debug") {
            traits.push(quote!(Debug));
        }
        if !has_derive(&input, "Serialize") {
            traits.push(quote!(serde::Serialize));
        }
        if !has_derive(&input, "Deserialize") {
            traits.push(quote!(serde::Deserialize));
        }
        if traits.is_empty() {
            quote!()
        } else {
            quote!(#[derive(#(#traits),*)])
        }
    };

    let assert_ident = quote::format_ident!("_AssertCourierMessage_{}", name);

    let expanded = quote! {
        #derives
        #input

        impl ::courier::Message for #name {
            const TYPE: &'static str = #type_tag;
            const VERSION: u16 = #version;
        }

        #[doc(hidden)]
        #[allow(dead_code, non_camel_case_types, non_snake_case)]
        const _: () = {
            fn #assert_ident() {
                fn assert_bounds<T: Send + Sync + 'static>() {}
                assert_bounds::<#name>();
            }
        };
    };

    TokenStream::from(expanded)
}
