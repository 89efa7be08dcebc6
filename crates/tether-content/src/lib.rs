//! Local cache of project content synchronized from the online service.
//!
//! A [`ContentStore`] owns one content directory: downloaded files plus a RON
//! metadata index. It applies the content messages of the service protocol
//! and answers metadata lookups once content is ready. [`ContentClient`]
//! wires a store to an online service connection from the application
//! config.

mod client;
mod error;
mod index;
mod store;

pub use client::{ClientError, ContentClient, connect};
pub use error::ContentError;
pub use index::ContentIndex;
pub use store::{ContentChange, ContentStore};
