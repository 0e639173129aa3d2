//! Built-in tool implementations for the agentic runtime.
//!
//! - **Utility tools** (`echo`): no namespace, always permitted
//! - **Discovery tools** (`search_tools`, `load_tools`): browse and load the
//!   module catalog; hidden when a run suppresses discovery
//! - **Stub tools**: catalog entries that answer with a canned payload, used
//!   by transcript replay and tests

pub mod discovery;
pub mod echo;
pub mod stub;

pub use discovery::{LoadToolsTool, SearchToolsTool};
pub use echo::EchoTool;
pub use stub::{load_catalog, CatalogEntry, StubTool};
