//! Test attributes that bound a test's wall-clock time.
//!
//! Both attributes run the test body on a dedicated thread and wait for it
//! with a deadline. The deadline is the attribute argument in seconds
//! (default 30) multiplied by `WAVE_TEST_TIMEOUT_SCALE` when that variable
//! holds a positive integer, so slow CI hosts can stretch every test at once.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Async test on a current-thread Tokio runtime with a deadline.
///
/// Replaces `#[tokio::test]`; a stray `#[tokio::test]` on the same item is dropped.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Tokio)
}

/// Synchronous test with a deadline. Replaces `#[test]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Blocking)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Tokio,
    Blocking,
}

fn expand(attr: TokenStream, item: TokenStream, flavor: Flavor) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = match syn::parse::<ItemFn>(item) {
        Ok(function) => function,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let is_async = sig.asyncness.is_some();
    match flavor {
        Flavor::Tokio if !is_async => {
            return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
                .to_compile_error()
                .into();
        }
        Flavor::Blocking if is_async => {
            return syn::Error::new_spanned(&sig.ident, "timeout needs a synchronous fn")
                .to_compile_error()
                .into();
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_replaced_test_attribute(attr))
        .collect();

    let body = match flavor {
        Flavor::Tokio => quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(__deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        },
        Flavor::Blocking => quote! { #block },
    };
    let harness = watchdog(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
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

fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __scale: u64 = std::env::var("WAVE_TEST_TIMEOUT_SCALE")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .filter(|scale: &u64| *scale > 0)
            .unwrap_or(1);
        let __deadline = std::time::Duration::from_secs(#secs.saturating_mul(__scale));
        let (__report, __outcome) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                #body
            }));
            let _ = __report.send(result);
        });
        match __outcome.recv_timeout(__deadline) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {:?}", __deadline)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated harness.
fn is_replaced_test_attribute(attr: &Attribute) -> bool {
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
