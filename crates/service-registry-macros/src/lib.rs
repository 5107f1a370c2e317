use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Expr, LitStr, Token};

struct RegisterServiceArgs {
    name: LitStr,
    address: Expr,
    port: Expr,
}

impl Parse for RegisterServiceArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let name: LitStr = input.parse()?;
        if name.value().trim().is_empty() {
            return Err(syn::Error::new(name.span(), "service name must not be empty"));
        }
        input.parse::<Token![,]>()?;
        let address: Expr = input.parse()?;
        input.parse::<Token![,]>()?;
        let port: Expr = input.parse()?;
        // trailing comma
        if input.peek(Token![,]) {
            input.parse::<Token![,]>()?;
        }

        Ok(RegisterServiceArgs {
            name,
            address,
            port,
        })
    }
}

/// Registers the calling service with the registry named by
/// `SERVICE_REGISTRY_URL` and starts its heartbeat.
///
/// The name must be a string literal; address and port may be any
/// expression. Expands to a call to `service_registry::bootstrap_service`,
/// so the result is a future resolving to `Result<Registration>`.
///
/// # Example
/// ```ignore
/// use service_registry::register_service;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let port: u16 = 8080;
///     let registration = register_service!("orders", "10.0.0.5", port).await?;
///     // serve traffic ...
///     registration.deregister().await?;
///     Ok(())
/// }
/// ```
#[proc_macro]
pub fn register_service(input: TokenStream) -> TokenStream {
    let RegisterServiceArgs {
        name,
        address,
        port,
    } = parse_macro_input!(input as RegisterServiceArgs);

    let expanded = quote! {
        ::service_registry::bootstrap_service(#name, #address, #port)
    };

    TokenStream::from(expanded)
}
