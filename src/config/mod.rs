pub mod field;
pub mod registry;
pub mod resource;
pub mod settings;
pub mod system;
pub mod validator;

pub use field::*;
pub use registry::*;
pub use resource::*;
pub use settings::*;
pub use validator::*;
