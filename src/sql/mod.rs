//! Safe SQL builder: identifiers from declarations only, values as parameters.

mod builder;
pub mod layout;
pub mod params;
pub use builder::*;
pub use layout::*;
pub use params::*;
