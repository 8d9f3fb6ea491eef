//! Distributed action-result caching for the mesh runtime.
//!
//! Results of actions marked as cached are stored under a key derived from
//! the action name and its call parameters. This crate provides:
//!
//! - [`KeyDeriver`]: canonical, order-independent keys with SHA-256
//!   overflow hashing for stores that limit key size;
//! - [`PacketCodec`]: the binary key/value packet layout (length-prefixed,
//!   zlib compressed above a threshold);
//! - [`CacheStore`]: the backing store contract, with the in-process
//!   [`PacketStore`] implementation;
//! - [`Cacher`]: the façade the broker uses, which turns every backend
//!   failure into a logged miss.
//!
//! # Key layout
//!
//! ```text
//! math.add:a|1|b|2
//! ^^^^^^^^ ^^^^^^^
//! action   canonical params
//! ```

mod cacher;
mod config;
mod error;
mod format;
mod hasher;
mod key;
mod memory;
mod packet;
mod store;

pub use cacher::Cacher;
pub use config::CacheConfig;
pub use error::{CacheError, CodecError};
pub use format::Format;
pub use hasher::{HasherPool, DIGEST_LENGTH};
pub use key::{canonicalize, KeyDeriver};
pub use memory::PacketStore;
pub use packet::{DecodedKey, PacketCodec};
pub use store::{CacheStore, CleanScope};
