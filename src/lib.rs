pub mod config;
pub mod http;
pub mod net;
pub mod node;
pub mod seeds;
pub mod store;
pub mod util;

pub use config::{Args, Config};
pub use net::{HandshakeMessage, NeighborsMessage, Record, RelayMessage};
pub use node::Node;
pub use seeds::Seeds;
pub use store::Storage;
