//! HTTP surface of the proxy.

mod proxy;

pub use proxy::{ProxyState, RouteKind, classify_route, proxy_router};
