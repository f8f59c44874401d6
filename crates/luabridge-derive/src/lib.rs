//! Derive macro for `luabridge::Reflect`.
//!
//! `#[derive(Reflect)]` on a struct with named fields exposes every field to
//! scripts, readable and assignable, under its Rust name. Field lookups from
//! scripts ignore case, so `song.Title` reaches a field named `title`.
//!
//! Field attributes:
//! - `#[reflect(rename = "Name")]`: expose the field under another name
//! - `#[reflect(readonly)]`: scripts can read but not assign the field
//! - `#[reflect(skip)]`: keep the field host-only
//!
//! Container attribute:
//! - `#[reflect(methods = path)]`: a `fn(StructBuilder<Self>) -> StructBuilder<Self>`
//!   that adds methods (or hand-written fields) after the derived ones
//!
//! Exposed fields are read by cloning, so their types must implement `Clone`
//! besides the bridge's conversion traits.
//!
//! ```ignore
//! #[derive(Clone, Default, Reflect)]
//! #[reflect(methods = song_methods)]
//! struct Song {
//!     title: String,
//!     artist: String,
//!     #[reflect(readonly)]
//!     plays: u32,
//! }
//!
//! fn song_methods(builder: StructBuilder<Song>) -> StructBuilder<Song> {
//!     builder.method("describe", |s: &mut Song| format!("{} - {}", s.title, s.artist))
//! }
//! ```

use std::result::Result as StdResult;

use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    ext::IdentExt, punctuated::Punctuated, spanned::Spanned, Data, DeriveInput, Expr, ExprLit,
    Fields, Lit, Meta,
};

/// Internal result type for macro parsing.
type Result<T> = StdResult<T, syn::Error>;

#[derive(Default)]
struct ContainerAttrs {
    methods: Option<syn::Path>,
}

#[derive(Default)]
struct FieldAttrs {
    rename: Option<String>,
    readonly: bool,
    skip: bool,
}

/// Collect the entries of every `#[reflect(...)]` attribute.
fn reflect_metas(attrs: &[syn::Attribute]) -> Result<Vec<Meta>> {
    let mut metas = Vec::new();
    for attr in attrs {
        if !attr.path().is_ident("reflect") {
            continue;
        }
        match &attr.meta {
            Meta::List(list) => metas.extend(
                list.parse_args_with(Punctuated::<Meta, syn::Token![,]>::parse_terminated)?,
            ),
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "expected #[reflect(...)] with arguments",
                ));
            }
        }
    }
    Ok(metas)
}

fn parse_container_attrs(attrs: &[syn::Attribute]) -> Result<ContainerAttrs> {
    let mut parsed = ContainerAttrs::default();
    for meta in reflect_metas(attrs)? {
        match &meta {
            Meta::NameValue(nv) if nv.path.is_ident("methods") => match &nv.value {
                Expr::Path(path) => parsed.methods = Some(path.path.clone()),
                other => {
                    return Err(syn::Error::new(other.span(), "expected a function path"));
                }
            },
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "unknown reflect attribute, expected `methods = path`",
                ));
            }
        }
    }
    Ok(parsed)
}

fn parse_field_attrs(attrs: &[syn::Attribute]) -> Result<FieldAttrs> {
    let mut parsed = FieldAttrs::default();
    for meta in reflect_metas(attrs)? {
        match &meta {
            Meta::Path(path) if path.is_ident("readonly") => parsed.readonly = true,
            Meta::Path(path) if path.is_ident("skip") => parsed.skip = true,
            Meta::NameValue(nv) if nv.path.is_ident("rename") => {
                parsed.rename = Some(parse_string_lit(&nv.value)?);
            }
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "unknown reflect attribute, expected `rename`, `readonly` or `skip`",
                ));
            }
        }
    }
    Ok(parsed)
}

fn parse_string_lit(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        other => Err(syn::Error::new(other.span(), "expected a string literal")),
    }
}

/// Derive `Reflect` from a struct's named fields.
#[proc_macro_derive(Reflect, attributes(reflect))]
pub fn derive_reflect(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    expand_reflect(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_reflect(input: &DeriveInput) -> Result<TokenStream> {
    let ident = &input.ident;
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            ident.span(),
            "#[derive(Reflect)] only supports structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(
            data.fields.span(),
            "#[derive(Reflect)] needs named fields",
        ));
    };
    let container = parse_container_attrs(&input.attrs)?;

    let mut registrations = Vec::new();
    for field in &fields.named {
        let attrs = parse_field_attrs(&field.attrs)?;
        if attrs.skip {
            continue;
        }
        let Some(member) = &field.ident else {
            continue;
        };
        let ty = &field.ty;
        let name = attrs.rename.unwrap_or_else(|| member.unraw().to_string());
        registrations.push(if attrs.readonly {
            quote! {
                .readonly_field(#name, |this: &Self| -> #ty {
                    ::std::clone::Clone::clone(&this.#member)
                })
            }
        } else {
            quote! {
                .field(
                    #name,
                    |this: &Self| -> #ty { ::std::clone::Clone::clone(&this.#member) },
                    |this: &mut Self, value: #ty| this.#member = value,
                )
            }
        });
    }

    let finish = match &container.methods {
        Some(path) => quote! { #path(builder).build() },
        None => quote! { builder.build() },
    };

    let mut generics = input.generics.clone();
    {
        let where_clause = generics.make_where_clause();
        where_clause
            .predicates
            .push(syn::parse_quote! { Self: 'static });
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::luabridge::Reflect for #ident #ty_generics #where_clause {
            fn reflect() -> ::luabridge::Shape {
                let builder = ::luabridge::TypeDescriptor::builder::<Self>()
                    #(#registrations)*;
                #finish
            }
        }
    })
}
