pub mod server;
pub mod upstream;
pub mod wire;

pub use server::DnsServer;
