pub mod authorization;
pub mod branch;
pub mod operation;
pub mod reading;
pub mod state;

pub use authorization::*;
pub use branch::*;
pub use operation::*;
pub use reading::*;
pub use state::*;
