//! DNS resolution
//!
//! Names are resolved locally for two things: the proxy's own host, and the
//! destination host when remote resolution ("rdns") is turned off.

pub use gai::GaiResolver;
pub use resolve::{Addrs, IntoResolve, Name, Resolve, Resolving};
pub(crate) use resolve::{DnsResolverWithOverrides, DynResolver};

pub(crate) mod gai;
pub(crate) mod resolve;
