//! Request extractors shared by the resource handlers.

mod request;

pub use request::RequestInfo;
