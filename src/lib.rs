#![doc = include_str!("../README.md")]
#![warn(
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    missing_docs,
    rust_2018_idioms
)]

pub mod common;
pub mod dump;
pub mod expand;
pub mod expr;
pub mod namespace;
pub mod store;
