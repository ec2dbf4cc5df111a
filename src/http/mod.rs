//! HTTP surface: the admission middleware and the server that hosts it.

mod middleware;
mod server;

pub use middleware::{
    admission_middleware, client_identifier, RejectionBody, RejectionDetails, RATELIMIT_LIMIT,
    RATELIMIT_REMAINING, RATELIMIT_RESET,
};
pub use server::{router, HttpServer};
