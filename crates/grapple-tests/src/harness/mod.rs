pub mod agent;
pub mod server;

pub use agent::TestAgent;
pub use server::TestServer;
