use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::{parse_macro_input, punctuated::Punctuated, FnArg, ItemFn, Lit, Meta, ReturnType, Token};

const NAME: &str = "name";
const DESCRIPTION: &str = "description";

fn string_attr(args: &Punctuated<Meta, Token![,]>, key: &str) -> Option<String> {
    args.iter().find_map(|meta| {
        if let Meta::NameValue(nv) = meta {
            if nv.path.is_ident(key) {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        return Some(lit.value());
                    }
                }
                abort!(nv.value, "Expected a string literal for {}", key);
            }
        }
        None
    })
}

/// Turn `async fn f(ctx: SubtaskContext) -> anyhow::Result<String>` into a
/// registered `WorkUnit`.
///
/// ```ignore
/// #[work_unit(name = "summarize", description = "Summarize one topic")]
/// async fn summarize(ctx: SubtaskContext) -> anyhow::Result<String> {
///     Ok(format!("Summary of {}", ctx.title))
/// }
/// ```
///
/// The unit is added to `fanout::WORK_UNITS` and picked up by
/// `WorkUnitRegistry::with_registered()`. The generated struct is
/// `f::f_WorkUnit`.
#[proc_macro_attribute]
#[proc_macro_error]
pub fn work_unit(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse work_unit attributes: {}", e));

    let fn_name = &input_fn.sig.ident;
    let name = string_attr(&attr_args, NAME).unwrap_or_else(|| fn_name.to_string());
    let description =
        string_attr(&attr_args, DESCRIPTION).unwrap_or_else(|| format!("Work unit {}", name));

    if input_fn.sig.asyncness.is_none() {
        abort!(input_fn.sig, "work_unit functions must be async");
    }
    if input_fn.sig.inputs.len() != 1 {
        abort!(
            input_fn.sig.inputs,
            "work_unit functions take exactly one SubtaskContext argument"
        );
    }
    if let Some(FnArg::Receiver(receiver)) = input_fn.sig.inputs.first() {
        abort!(receiver, "work_unit functions cannot take self");
    }
    if let ReturnType::Default = input_fn.sig.output {
        abort!(input_fn.sig, "work_unit functions must return anyhow::Result<String>");
    }

    let fn_vis = &input_fn.vis;
    let unit_struct_name = format_ident!("{}_WorkUnit", fn_name);

    let expanded = quote! {
        #input_fn

        #fn_vis mod #fn_name {
            use super::*;

            #[allow(non_camel_case_types)]
            #[derive(Debug, Default, Clone, Copy)]
            pub struct #unit_struct_name;

            #[::async_trait::async_trait]
            impl ::fanout::WorkUnit for #unit_struct_name {
                fn name(&self) -> &str {
                    #name
                }

                fn description(&self) -> &str {
                    #description
                }

                async fn execute(
                    &self,
                    ctx: ::fanout::SubtaskContext,
                ) -> ::anyhow::Result<::std::string::String> {
                    ::tracing::debug!(unit = #name, subtask_id = %ctx.subtask_id, "Executing work unit");
                    super::#fn_name(ctx).await
                }
            }

            #[::linkme::distributed_slice(::fanout::WORK_UNITS)]
            static WORK_UNIT_REGISTRATION: fn() -> ::std::sync::Arc<dyn ::fanout::WorkUnit> = __register_work_unit;

            fn __register_work_unit() -> ::std::sync::Arc<dyn ::fanout::WorkUnit> {
                ::std::sync::Arc::new(#unit_struct_name)
            }
        }
    };

    TokenStream::from(expanded)
}
