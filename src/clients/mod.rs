pub mod game_client;

#[cfg(test)]
pub(crate) mod fake;

pub use game_client::{Credentials, GameClient, RocWebClient};
