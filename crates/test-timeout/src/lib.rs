//! Test attributes that fail a hung test instead of wedging the whole run.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, while
//! `#[test_timeout::tokio_timeout_test]` wraps an async one and drives it on
//! a current-thread tokio runtime. Both accept an optional number of seconds
//! (default 60). `LIVEBENCH_TEST_TIMEOUT_SECS` overrides the limit at run
//! time for slow CI hosts.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Sync,
    Tokio,
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(Flavor::Sync, attr, item)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(Flavor::Tokio, attr, item)
}

fn expand(flavor: Flavor, attr: TokenStream, item: TokenStream) -> TokenStream {
    let result = parse_timeout(attr).and_then(|secs| {
        let function = syn::parse::<ItemFn>(item)?;
        wrap(flavor, secs, function)
    });
    match result {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit = syn::parse::<LitInt>(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn wrap(flavor: Flavor, secs: u64, function: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let is_async = sig.asyncness.is_some();
    match flavor {
        Flavor::Sync if is_async => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous test function; use tokio_timeout_test",
            ));
        }
        Flavor::Tokio if !is_async => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test can only be applied to async functions",
            ));
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = match flavor {
        Flavor::Sync => quote! { #block },
        Flavor::Tokio => quote! {{
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        }},
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::env::var("LIVEBENCH_TEST_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(std::time::Duration::from_secs)
                .unwrap_or(std::time::Duration::from_secs(#secs));
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would double-register the function.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
