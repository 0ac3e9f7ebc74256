//! Concrete programmer backends.
//!
//! One module per toolchain; all of them stage image and read-back data
//! through temp directories and normalize tool failures into the shared
//! error taxonomy.

mod cube;
mod openocd;
mod pystlink;

pub use cube::CubeProgrammerBackend;
pub use openocd::OpenOcdBackend;
pub use pystlink::PyStLinkBackend;
