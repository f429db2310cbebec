//! HTTP handlers: the per-collection resource controller and its pagination helpers.

pub mod pagination;
pub mod resource;

pub use resource::Resource;
