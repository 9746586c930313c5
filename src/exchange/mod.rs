//! Contract-exchange access: authenticated REST client and the streaming
//! market-data connection.

pub mod client;
pub mod stream;

pub use client::{ClientError, ExchangeClient};
pub use stream::ExchangeStream;
