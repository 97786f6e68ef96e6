// SPDX-License-Identifier: MIT

//! Keeps a PostgreSQL store of firmware catalog data in sync with a tree
//! of vendor repository directories.

pub mod access;
pub mod catalog;
pub mod db;
pub mod debug;
pub mod error;
pub mod gate;
pub mod reconcile;
pub mod repository;
pub mod settings;
pub mod store;
pub mod sync;
pub mod watcher;
pub mod xml;

pub use error::{Error, Result};
