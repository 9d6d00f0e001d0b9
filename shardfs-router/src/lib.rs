// SPDX-License-Identifier: AGPL-3.0-or-later
//! shardfs router
//!
//! Front end of the cluster: accepts client commands, keeps the default file
//! type on local disk and forwards every other type to its storage node.

pub mod aggregate;
pub mod client;
pub mod dispatch;
pub mod server;

pub use aggregate::ListingSegment;
pub use client::RouterClient;
pub use dispatch::{Flow, Session};
pub use server::{Router, RouterContext};
