pub mod registry;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum TlsMode {
    /// No TLS (HTTP)
    #[default]
    None,
    /// Accept self-signed certificates (HTTPS)
    SelfSigned,
}
