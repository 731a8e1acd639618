pub mod general;
pub mod macros;
