//! # SSR Bridge
//!
//! Server-side rendering for Inertia-style page payloads. A user-supplied
//! render module, written either as CommonJS (`module.exports = { render }`)
//! or as an ES module (`export function render`), runs inside a sandboxed
//! deno_core isolate and returns `{ head, body }` for the host to splice into
//! its HTML document.
//!
//! ## Sandbox
//!
//! - **Filesystem**: modules can only import files under the sandbox root
//! - **Network**: remote imports are blocked; `fetch()` only reaches allowlisted origins
//! - **No environment, shell or `require()`**: render modules must be bundled
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ssr_bridge::{PagePayload, SsrBridge, SsrConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ssr_bridge::SsrError> {
//!     let bridge = SsrBridge::start(SsrConfig::new("./priv/ssr.js"))?;
//!
//!     let page = PagePayload::new("Users/Index", "/users")?.with_prop("content", "Hello");
//!     let result = bridge.render(page).await?;
//!
//!     println!("{}\n{}", result.head_html(), result.body);
//!     Ok(())
//! }
//! ```

mod bridge;
mod config;
mod error;
mod fetch;
mod loader;
mod module;
mod ops;
mod page;
mod render;
mod runtime;

pub use bridge::SsrBridge;
pub use config::SsrConfig;
pub use error::{OutputViolation, PageContext, SsrError, SsrResult};
pub use fetch::FetchPolicy;
pub use module::{ModuleKind, ModuleRef};
pub use page::{AssetVersion, PagePayload};
pub use render::RenderResult;
pub use runtime::{RenderModuleHandle, SsrRuntime};
pub use tokio_util::sync::CancellationToken;
