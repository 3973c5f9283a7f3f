mod assignment;
mod event;
mod event_management;
mod request;
mod result;
mod search;

pub use assignment::*;
pub use event::*;
pub use event_management::*;
pub use request::*;
pub use result::*;
pub use search::*;
