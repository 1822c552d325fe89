pub mod assistant;
pub mod broadcaster;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod mentions;
pub mod message_state;
pub mod mutation;
pub mod registry;
pub mod session;
pub mod store;

pub use dispatcher::{Gateway, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use store::Services;
