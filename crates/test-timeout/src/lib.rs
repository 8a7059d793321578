//! Watchdog attributes for tests.
//!
//! `#[timeout]` (sync) and `#[tokio_timeout_test]` (async) run the test body
//! on a detached thread and fail with "test timed out" if it does not report
//! back within the deadline, so a wedged session loop aborts the test run
//! instead of hanging it. The deadline defaults to 60 seconds, can be set per
//! test (`#[timeout(5)]`), and can be raised globally for slow machines via
//! the `TEST_TIMEOUT_SECS` environment variable.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_deadline(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test for async",
        )
        .to_compile_error()
        .into();
    }
    let block = &func.block;
    let body = quote! { #block };
    expand(func.clone(), secs, body)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_deadline(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    func.sig.asyncness = None;
    let block = &func.block;
    // The runtime lives on the watchdog-supervised thread; the inner
    // tokio timeout catches hangs that still yield to the scheduler.
    let body = quote! {
        {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(__deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };
    expand(func.clone(), secs, body)
}

fn parse_deadline(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(60);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(func: ItemFn, secs: u64, body: TokenStream2) -> TokenStream {
    let ItemFn { attrs, vis, sig, .. } = func;
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_harness_attribute(attr))
        .collect();
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __deadline = std::env::var("TEST_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|secs| *secs > #secs)
                .map(std::time::Duration::from_secs)
                .unwrap_or(std::time::Duration::from_secs(#secs));
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || #body));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(__deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

// Strip `#[test]` / `#[tokio::test]` left on the item so the generated
// `#[test]` is the only harness entry point.
fn is_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(segments.as_slice(), [only] if only == "test")
        || matches!(segments.as_slice(), [first, second] if first == "tokio" && second == "test")
}
