use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::{format_ident, quote};
use syn::{parse_macro_input, FnArg, ItemFn, ReturnType, Type};
use darling::ast::NestedMeta;
use darling::FromMeta;

mod common;

use common::to_compile_error;

/// Task attribute options
#[derive(Debug, Default, FromMeta)]
struct TaskOptions {
    /// Name the function is registered under, defaults to the function name
    #[darling(default)]
    name: Option<String>,
    /// Name of the generated `TaskDef` constant
    #[darling(default)]
    constant: Option<String>,
}

/// Registers a plain function as a task runnable in a worker process.
///
/// The function is kept as written. Next to it the macro emits a
/// `pledge_api::task::TaskDef` constant (named `<FN>_TASK` by default) whose
/// invoker checks the argument count, decodes every argument from JSON,
/// calls the function and encodes its `Ok` value back to JSON. An `Err` is
/// reported as `TaskError::Failed` with the error's `Display` text.
///
/// Every argument type must implement `serde::de::DeserializeOwned`, the
/// function must return `Result<T, E>` with `T: Serialize` and `E: Display`.
///
/// ```rust
/// use pledge_api::{task, TaskRegistry};
///
/// #[task]
/// fn add(a: i64, b: i64) -> Result<i64, String> {
///     Ok(a + b)
/// }
///
/// #[task(name = "greet", constant = "GREETER")]
/// fn hello(who: String) -> Result<String, String> {
///     Ok(format!("hello {who}"))
/// }
///
/// let registry = TaskRegistry::new().with(ADD_TASK).with(GREETER);
/// assert_eq!(registry.names(), vec!["add", "greet"]);
/// ```
#[proc_macro_attribute]
pub fn task(args: TokenStream, input: TokenStream) -> TokenStream {
    let attr_args = match NestedMeta::parse_meta_list(args.into()) {
        Ok(list) => list,
        Err(e) => return TokenStream::from(darling::Error::from(e).write_errors()),
    };
    let options = match TaskOptions::from_list(&attr_args) {
        Ok(options) => options,
        Err(e) => return TokenStream::from(e.write_errors()),
    };
    let func = parse_macro_input!(input as ItemFn);

    match expand_task(options, func) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(e) => to_compile_error(e),
    }
}

fn expand_task(options: TaskOptions, func: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &func.sig;

    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(asyncness, "task functions cannot be async"));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "task functions cannot be generic",
        ));
    }
    if let ReturnType::Default = sig.output {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "task functions must return Result<T, E>",
        ));
    }

    let mut arg_types: Vec<Type> = Vec::new();
    for input in &sig.inputs {
        match input {
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "task functions cannot take self",
                ));
            }
            FnArg::Typed(pat_type) => arg_types.push((*pat_type.ty).clone()),
        }
    }

    let fn_name = &sig.ident;
    let vis = &func.vis;
    let task_name = options.name.unwrap_or_else(|| fn_name.to_string());
    let const_name = match options.constant {
        Some(constant) => Ident::new(&constant, Span::call_site()),
        None => format_ident!("{}_TASK", fn_name.to_string().to_uppercase()),
    };
    let arity = arg_types.len();
    let indices: Vec<usize> = (0..arity).collect();
    let bindings: Vec<Ident> = indices.iter().map(|i| format_ident!("__arg{}", i)).collect();
    let doc = format!("Registration of the `{task_name}` task function.");

    Ok(quote! {
        #func

        #[doc = #doc]
        #vis const #const_name: ::pledge_api::task::TaskDef = {
            #[allow(unused_mut, unused_variables)]
            fn __invoke(
                args: ::std::vec::Vec<::pledge_api::task::Value>,
            ) -> ::std::result::Result<::pledge_api::task::Value, ::pledge_api::errors::TaskError> {
                ::pledge_api::task::check_arity(#task_name, #arity, &args)?;
                let mut args = args.into_iter();
                #(
                    let #bindings: #arg_types = ::pledge_api::task::decode_arg(
                        #task_name,
                        #indices,
                        args.next().unwrap_or(::pledge_api::task::Value::Null),
                    )?;
                )*
                match #fn_name(#(#bindings),*) {
                    ::std::result::Result::Ok(value) => ::pledge_api::task::encode_result(#task_name, &value),
                    ::std::result::Result::Err(error) => ::std::result::Result::Err(
                        ::pledge_api::errors::TaskError::Failed {
                            function: ::std::string::String::from(#task_name),
                            message: ::std::string::ToString::to_string(&error),
                        },
                    ),
                }
            }

            ::pledge_api::task::TaskDef::new(#task_name, __invoke)
        };
    })
}

