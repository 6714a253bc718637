pub mod custody;
pub mod math;
pub mod node;
pub mod state;
pub mod types;
pub mod validation;
