use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Fields, Lit, LitStr, Meta, Type};

/// Derive macro describing a CSV input record.
///
/// For each named field it records:
/// - the column name (`#[serde(rename = "...")]` wins over the field name)
/// - whether the column is required (anything but `Option<T>`)
/// - a description taken from the doc comments
/// - an optional sample value from `#[csv(example = "...")]`
///
/// Generates `csv_schema() -> &'static [CsvField]` and
/// `csv_header() -> Vec<&'static str>`. `CsvField` must be in scope.
#[proc_macro_derive(CsvSchema, attributes(serde, csv))]
pub fn derive_csv_schema(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

struct Column {
    name: String,
    required: bool,
    description: String,
    example: Option<String>,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "CsvSchema requires named fields",
                ))
            }
        },
        _ => return Err(syn::Error::new_spanned(name, "CsvSchema only supports structs")),
    };

    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(field, "unnamed field"))?;
        columns.push(Column {
            name: serde_rename(&field.attrs)?.unwrap_or_else(|| ident.to_string()),
            required: !is_option(&field.ty),
            description: doc_comment(&field.attrs),
            example: csv_example(&field.attrs)?,
        });
    }

    let entries = columns.iter().map(|c| {
        let Column {
            name,
            required,
            description,
            example,
        } = c;
        let example = match example {
            Some(e) => quote!(Some(#e)),
            None => quote!(None),
        };
        quote! {
            CsvField {
                name: #name,
                required: #required,
                description: #description,
                example: #example,
            }
        }
    });

    Ok(quote! {
        impl #name {
            pub fn csv_schema() -> &'static [CsvField] {
                static SCHEMA: &[CsvField] = &[
                    #(#entries),*
                ];
                SCHEMA
            }

            pub fn csv_header() -> Vec<&'static str> {
                Self::csv_schema().iter().map(|f| f.name).collect()
            }
        }
    })
}

fn serde_rename(attrs: &[syn::Attribute]) -> syn::Result<Option<String>> {
    let mut rename = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let lit: LitStr = meta.value()?.parse()?;
                rename = Some(lit.value());
            } else if meta.input.peek(syn::Token![=]) {
                // other key = value serde options are irrelevant here
                let _: Expr = meta.value()?.parse()?;
            }
            Ok(())
        })?;
    }
    Ok(rename)
}

fn csv_example(attrs: &[syn::Attribute]) -> syn::Result<Option<String>> {
    let mut example = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident("csv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("example") {
                let lit: LitStr = meta.value()?.parse()?;
                example = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unsupported csv attribute, expected `example`"))
            }
        })?;
    }
    Ok(example)
}

fn doc_comment(attrs: &[syn::Attribute]) -> String {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(nv) => match &nv.value {
                Expr::Lit(expr_lit) => match &expr_lit.lit {
                    Lit::Str(s) => Some(s.value().trim().to_string()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_option(ty: &Type) -> bool {
    matches!(ty, Type::Path(p) if p.path.segments.last().is_some_and(|s| s.ident == "Option"))
}
