// SPDX-License-Identifier: MIT

pub mod functions;
pub mod models;
pub mod pg;
pub mod schema;
pub mod setup;
