//! Built-in key-value drivers.
//!
//! ## Configuration Format
//!
//! The driver section of a config file names the driver and carries a
//! driver-specific options object that the engine treats as opaque:
//!
//! ```json
//! {
//!     "db": { "name": "...", "options": { } },
//!     ...
//! }
//! ```
//!
//! The field `name` must equal the name the driver registered under; the
//! `options` value is handed to the driver's constructor untouched. For the
//! available options of a built-in driver, refer to its module-level
//! documentation.
//!
//! ## Registering New Drivers
//!
//! To benchmark your own store, implement [`crate::db::KVStore`] for it,
//! write a constructor with the signature
//! `fn(&[String], &serde_json::Value) -> Result<Arc<dyn KVStore>, Error>`,
//! and register it with [`inventory`]: `inventory::submit! {
//! Registry::new("name", constructor_fn) };`. The built-in drivers are good
//! examples of the process.

pub mod dummy;
