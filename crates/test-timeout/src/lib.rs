use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Parsed attribute arguments: `(secs)`, `(paused)`, `(secs, paused)`.
struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

enum TimeoutArg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(TimeoutArg::Secs)
        } else {
            input.parse().map(TimeoutArg::Flag)
        }
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TimeoutArg::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new(
                            lit.span(),
                            "timeout must be greater than zero",
                        ));
                    }
                    args.secs = secs;
                }
                TimeoutArg::Flag(flag) if flag == "paused" => args.paused = true,
                TimeoutArg::Flag(flag) => {
                    return Err(syn::Error::new(
                        flag.span(),
                        format!("unknown option `{flag}`, expected `paused`"),
                    ));
                }
            }
        }
        Ok(args)
    }
}

/// Runs an async test on a fresh current-thread runtime and fails it if
/// it does not finish within the wall-clock budget.
///
/// `paused` starts the runtime with tokio's clock paused so sleeps
/// auto-advance; the in-runtime deadline is skipped in that mode because
/// virtual time would trip it, leaving only the wall-clock guard.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attributes(attrs);
    let secs = args.secs;
    let configure_clock = if args.paused {
        quote! { builder.start_paused(true); }
    } else {
        TokenStream2::new()
    };
    let run = if args.paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    let body = quote! {
        let mut builder = tokio::runtime::Builder::new_current_thread();
        builder.enable_all();
        #configure_clock
        let runtime = builder.build().expect("failed to build Tokio runtime");
        #run
    };
    TokenStream::from(wrap_with_watchdog(attrs, vis, sig, secs, body))
}

/// Synchronous counterpart of [`tokio_timeout_test`].
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.paused {
        return syn::Error::new_spanned(
            &sig.ident,
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attributes(attrs);
    let body = quote! { #block; };
    TokenStream::from(wrap_with_watchdog(attrs, vis, sig, args.secs, body))
}

fn wrap_with_watchdog(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the
/// only harness attribute.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
