mod common;
mod memory;
mod routing;
