// src/lib.rs
pub mod config;
pub mod conn;
pub mod diskfile;
pub mod error;
pub mod http;
pub mod mime;
pub mod outbuf;
pub mod parser;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use config::ServerConfig;
pub use conn::RequestView;
pub use error::{Result, ServerError};
pub use http::{Dispatch, Method, Reply, Version};
pub use mime::MimeTable;
pub use router::{
    BasicAuth, ContentEntry, ContentKind, DiskRoot, Embedded, MatchMode, Outcome,
};
pub use server::Server;
