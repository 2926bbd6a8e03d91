pub mod message;
pub mod provider;
pub mod response;
pub mod tool;

pub use message::*;
pub use provider::*;
pub use response::*;
pub use tool::*;
