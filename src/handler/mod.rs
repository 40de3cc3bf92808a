pub mod handler;
pub mod middleware;
#[cfg(test)]
mod tests;
pub mod verify;
pub use handler::router;
