//! funnel-mcp: an aggregating gateway for the Model Context Protocol.
//!
//! One long-lived process speaks MCP to a host over stdio while connecting
//! to many downstream MCP servers (child processes or HTTP/SSE endpoints),
//! funnelling their combined tool catalogs behind a small synthesized
//! surface: semantic `find`, routed `run`, and optionally a sandboxed
//! `code` tool.

pub mod aggregator;
pub mod catalog;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod confirm;
pub mod egress;
pub mod error;
pub mod index;
pub mod internal;
pub mod logger;
pub mod sandbox;
pub mod server;
pub mod transport;

pub use aggregator::MCPAggregator;
pub use catalog::{Catalog, CatalogSnapshot, ToolRecord};
pub use config::{Config, ServerConfig, Settings, SurfaceMode};
pub use error::{GatewayError, Result};
pub use index::{LexicalEmbedder, SemanticIndex, VectorStore};
pub use server::GatewayServer;
