//! Message-passing worker proxies: wire types, the client handle, and the
//! service task behind it.

pub(crate) mod handle;
pub(crate) mod messages;
pub(crate) mod service;
