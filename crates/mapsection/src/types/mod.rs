mod position;
mod request;
mod response;
mod settings;

pub use position::*;
pub use request::*;
pub use response::*;
pub use settings::*;
