pub mod client_iface;
pub mod config;
pub mod election;
pub mod error;
pub mod id;
pub mod log;
pub mod message;
pub mod replica;
pub mod replication;
pub mod state_machine;
pub mod transport;

pub use config::Config;
pub use error::RaftError;
pub use id::ReplicaId;
pub use message::{Body, Message};
pub use replica::{Replica, ReplicaState};
pub use transport::{address_of, Transport, UdpTransport};
