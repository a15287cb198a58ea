use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Type, parse_macro_input};

#[derive(Clone, Copy, PartialEq)]
enum Storage {
    Value,
    Flatten,
    Entity,
}

struct FieldSpec<'a> {
    ident: &'a Ident,
    ty: &'a Type,
    name: String,
    noindex: bool,
    storage: Storage,
}

fn struct_kind(input: &DeriveInput) -> syn::Result<String> {
    let mut kind = input.ident.to_string();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("kv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                let lit: LitStr = meta.value()?.parse()?;
                kind = lit.value();
                Ok(())
            } else {
                Err(meta.error("expected `kind = \"...\"`"))
            }
        })?;
    }
    Ok(kind)
}

/// `None` for `#[kv(skip)]` fields.
fn field_spec(field: &syn::Field) -> syn::Result<Option<FieldSpec<'_>>> {
    let Some(ident) = field.ident.as_ref() else {
        return Err(syn::Error::new_spanned(field, "KvEntity needs named fields"));
    };
    let mut spec = FieldSpec {
        ident,
        ty: &field.ty,
        name: ident.to_string(),
        noindex: false,
        storage: Storage::Value,
    };
    let mut skip = false;
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("kv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let lit: LitStr = meta.value()?.parse()?;
                spec.name = lit.value();
            } else if meta.path.is_ident("noindex") {
                spec.noindex = true;
            } else if meta.path.is_ident("flatten") {
                spec.storage = Storage::Flatten;
            } else if meta.path.is_ident("entity") {
                spec.storage = Storage::Entity;
            } else if meta.path.is_ident("skip") {
                skip = true;
            } else {
                return Err(meta.error("unsupported kv attribute"));
            }
            Ok(())
        })?;
    }
    if spec.name.is_empty() || spec.name.contains('.') {
        return Err(syn::Error::new_spanned(
            field,
            "property names must be non-empty and must not contain '.'",
        ));
    }
    Ok((!skip).then_some(spec))
}

fn save_field(field: &FieldSpec) -> TokenStream2 {
    let ident = field.ident;
    let name = &field.name;
    let noindex = field.noindex;
    match field.storage {
        Storage::Value => quote! {
            properties.push(::kindstore::Property {
                name: #name.to_string(),
                value: ::kindstore::ToValue::to_value(&self.#ident)?,
                no_index: #noindex,
            });
        },
        Storage::Entity => quote! {
            properties.push(::kindstore::Property {
                name: #name.to_string(),
                value: ::kindstore::save_nested(&self.#ident)?,
                no_index: #noindex,
            });
        },
        Storage::Flatten => quote! {
            for property in ::kindstore::KvEntity::save(&self.#ident)? {
                let mut property = property.prefixed(#name);
                property.no_index |= #noindex;
                properties.push(property);
            }
        },
    }
}

fn load_arm(field: &FieldSpec) -> Option<TokenStream2> {
    let ident = field.ident;
    let ty = field.ty;
    let name = &field.name;
    match field.storage {
        Storage::Value => Some(quote! {
            #name => match <#ty as ::kindstore::FromValue>::from_value(property.value) {
                Ok(value) => self.#ident = value,
                Err(err) => {
                    mismatch.get_or_insert(::kindstore::Error::FieldMismatch {
                        type_name: TYPE_NAME.to_string(),
                        field: #name.to_string(),
                        reason: err.to_string(),
                    });
                }
            },
        }),
        Storage::Entity => Some(quote! {
            #name => {
                if let Err(err) = ::kindstore::load_nested(&mut self.#ident, property.value, options) {
                    if err.is_field_mismatch() {
                        mismatch.get_or_insert(err);
                    } else {
                        failure.get_or_insert(err);
                    }
                }
            }
        }),
        Storage::Flatten => None,
    }
}

/// Collects `name.rest` properties for a flattened field.
fn flatten_collect(field: &FieldSpec, index: usize) -> TokenStream2 {
    let prefix = format!("{}.", field.name);
    let bucket = quote::format_ident!("__flattened_{}", index);
    quote! {
        if let Some(rest) = property.name.strip_prefix(#prefix) {
            #bucket.push(::kindstore::Property {
                name: rest.to_string(),
                ..property
            });
            continue;
        }
    }
}

fn flatten_load(field: &FieldSpec, index: usize) -> TokenStream2 {
    let ident = field.ident;
    let bucket = quote::format_ident!("__flattened_{}", index);
    quote! {
        if !#bucket.is_empty() {
            if let Err(err) = ::kindstore::KvEntity::load(&mut self.#ident, #bucket, options) {
                if err.is_field_mismatch() {
                    mismatch.get_or_insert(err);
                } else {
                    failure.get_or_insert(err);
                }
            }
        }
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(input, "KvEntity can only be derived for structs"));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new_spanned(input, "KvEntity needs named fields"));
    };
    let kind = struct_kind(input)?;
    let mut fields = Vec::new();
    for field in named.named.iter() {
        if let Some(spec) = field_spec(field)? {
            fields.push(spec);
        }
    }

    let saves = fields.iter().map(save_field);
    let arms = fields.iter().filter_map(load_arm);
    let flattened: Vec<(usize, &FieldSpec)> = fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.storage == Storage::Flatten)
        .collect();
    let buckets = flattened.iter().map(|(i, _)| {
        let bucket = quote::format_ident!("__flattened_{}", i);
        quote! { let mut #bucket = ::kindstore::PropertyList::new(); }
    });
    let collects = flattened.iter().map(|(i, f)| flatten_collect(f, *i));
    let flatten_loads = flattened.iter().map(|(i, f)| flatten_load(f, *i));
    let property_names: Vec<&String> = fields.iter().map(|f| &f.name).collect();

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let registration = input.generics.params.is_empty().then(|| {
        quote! {
            ::kindstore::inventory::submit! {
                ::kindstore::EntityMeta {
                    type_path: concat!(module_path!(), "::", stringify!(#struct_name)),
                    kind: #kind,
                    property_names: || vec![#(#property_names),*],
                }
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::kindstore::KvEntity for #struct_name #ty_generics #where_clause {
            fn save(&self) -> ::std::result::Result<::kindstore::PropertyList, ::kindstore::Error> {
                let mut properties = ::kindstore::PropertyList::new();
                #(#saves)*
                Ok(properties)
            }

            fn load(
                &mut self,
                properties: ::kindstore::PropertyList,
                options: &::kindstore::LoadOptions,
            ) -> ::std::result::Result<(), ::kindstore::Error> {
                const TYPE_NAME: &str = stringify!(#struct_name);
                let mut mismatch: ::std::option::Option<::kindstore::Error> = None;
                #[allow(unused_mut)]
                let mut failure: ::std::option::Option<::kindstore::Error> = None;
                #(#buckets)*
                for property in properties {
                    #(#collects)*
                    match property.name.as_str() {
                        #(#arms)*
                        other => {
                            mismatch.get_or_insert(::kindstore::Error::FieldMismatch {
                                type_name: TYPE_NAME.to_string(),
                                field: other.to_string(),
                                reason: "no such struct field".to_string(),
                            });
                        }
                    }
                }
                #(#flatten_loads)*
                if let Some(err) = failure {
                    return Err(err);
                }
                match mismatch {
                    Some(err) if !options.suppress_field_mismatch => Err(err),
                    _ => Ok(()),
                }
            }
        }

        impl #impl_generics ::kindstore::EntityKind for #struct_name #ty_generics #where_clause {
            fn kind() -> &'static str {
                #kind
            }
        }

        #registration
    })
}

/// Derives `KvEntity` and `EntityKind` for a struct with named fields.
///
/// Struct attribute: `#[kv(kind = "...")]` (defaults to the struct name).
/// Field attributes: `#[kv(name = "...")]`, `#[kv(noindex)]`,
/// `#[kv(flatten)]` (store a `KvEntity` field as `name.sub` properties),
/// `#[kv(entity)]` (store it as a nested entity value) and `#[kv(skip)]`.
#[proc_macro_derive(KvEntity, attributes(kv))]
pub fn derive_kv_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
