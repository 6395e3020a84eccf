//! filehub: one access layer over many storage backends
//!
//! Local directories, SFTP shares and S3 buckets are exposed through a
//! single driver contract, and every operation is authorized per user and
//! per path before it reaches a backend.
//!
//! # Architecture
//!
//! - **Drivers**: Backends implementing [`driver::StorageDriver`], created by
//!   type name from the [`driver::DriverRegistry`].
//! - **Permission Engine**: Resolves (principal, source, path, action) to
//!   allow/deny by longest-prefix matching over a user's rules.
//! - **Secure Driver**: Decorator that consults the permission engine before
//!   delegating each operation.
//! - **Driver Cache**: Builds one secured, initialized driver per source on
//!   first use.
//! - **WebDAV Bridge**: Path rewriting, per-source lock tables and the
//!   filesystem view a WebDAV handler drives.
//!
//! # Example
//!
//! ```no_run
//! use filehub::config::Config;
//! use filehub::hub::FileHub;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("filehub.yaml".as_ref())?;
//! let hub = FileHub::from_config(&config);
//!
//! let ctx = hub.login("alice").await?;
//! let docs = hub.driver(&ctx, "docs").await?;
//! for entry in docs.list(&ctx, "/").await? {
//!     println!("{}", entry.name);
//! }
//!
//! hub.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod dav;
pub mod driver;
pub mod env;
pub mod error;
pub mod hub;
pub mod model;
pub mod permission;
pub mod store;

pub use error::{FileHubError, Result};
