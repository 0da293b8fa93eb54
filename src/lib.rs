//! # httpony
//!
//! A from-scratch HTTP/1.1 engine: splittable byte streams with chunked
//! coding, a message codec, a blocking client with persistent connections,
//! a threaded server (optionally over TLS) and a router with mounting.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use httpony::http::{Request, Response};
//! use httpony::router::Router;
//! use httpony::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut api = Router::new();
//!     api.get("/items/:id", |req: Request| {
//!         format!("item {}", req.param("id").unwrap_or_default())
//!     });
//!
//!     let mut router = Router::new();
//!     router
//!         .get("/", |_req: Request| Response::from_body("Hello, World!"))
//!         .mount("/api", api);
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(router).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod context;
pub mod http;
pub mod net;
pub mod router;
pub mod server;
pub mod stream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, ClientError};
pub use context::{Env, Params};
pub use http::{Body, Headers, IntoResponse, Method, Request, Response, StatusCode, Uri};
pub use router::Router;
pub use server::{Server, ServerError};
pub use stream::{ByteStream, InputStream};
