pub mod auth;
pub mod circular_buffer;
pub mod config;
pub mod health;
pub mod heartbeat;
pub mod history;
pub mod pending;
pub mod quality;
pub mod reconnect;
pub mod request;
pub mod retry;
pub mod state;
pub mod types;

pub use auth::*;
pub use circular_buffer::*;
pub use config::*;
pub use health::*;
pub use heartbeat::*;
pub use history::*;
pub use pending::*;
pub use quality::*;
pub use reconnect::*;
pub use request::*;
pub use retry::*;
pub use state::*;
pub use types::*;
