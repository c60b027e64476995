pub mod io;
pub mod memory;
