// Proxy module - credential pools, routing and format translation

pub mod credentials;
pub mod response;
pub mod route;
pub mod translator;
