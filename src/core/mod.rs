//! Core types shared by every layer: the error taxonomy and its classification.

pub mod error;

pub use error::{DepcacheError, ErrorContext, ErrorOrigin, find_depcache_error, user_friendly_error};
