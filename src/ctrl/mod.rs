mod exchange;

pub use exchange::{ExchangeChannel, ExchangeListener, ACK};
