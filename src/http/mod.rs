pub mod server;

pub use server::{router, CacheServer};
